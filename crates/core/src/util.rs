/// Render a duration the way `time.Duration` prints in Go logs, truncated to
/// whole seconds: `0s`, `42s`, `1m30s`, `2h3m4s`.
pub(crate) fn format_duration(duration: chrono::Duration) -> String {
  let total = duration.num_seconds().max(0);
  let hours = total / 3600;
  let minutes = (total % 3600) / 60;
  let seconds = total % 60;

  if hours > 0 {
    return format!("{hours}h{minutes}m{seconds}s");
  }
  if minutes > 0 {
    return format!("{minutes}m{seconds}s");
  }
  return format!("{seconds}s");
}

/// Truncate `s` to at most `max` bytes, appending `…` when something was cut
/// and the width allows it. Never splits a UTF-8 sequence.
pub(crate) fn truncate_str(s: &str, max: usize) -> String {
  if s.len() <= max {
    return s.to_string();
  }

  const ELLIPSIS: &str = "…";
  if max > ELLIPSIS.len() {
    let mut result = s[..floor_char_boundary(s, max - ELLIPSIS.len())].to_string();
    result.push_str(ELLIPSIS);
    return result;
  }
  return s[..floor_char_boundary(s, max)].to_string();
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
  let mut index = index.min(s.len());
  while index > 0 && !s.is_char_boundary(index) {
    index -= 1;
  }
  return index;
}

/// The first eight characters of a session id, enough to correlate log lines.
pub(crate) fn short_session_id(session_id: &str) -> &str {
  let end = floor_char_boundary(session_id, 8);
  return &session_id[..end];
}
