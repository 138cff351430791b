mod ftp;
mod http;
mod ssh;

pub(crate) use ftp::FtpServer;
pub(crate) use http::HttpServer;
pub(crate) use ssh::SshServer;
