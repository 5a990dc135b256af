mod client;
mod progress;
mod token;

pub use client::{
    ErrorClass, FileListPage, Precreated, Quota, RemoteFile, UserInfo, WritePolicy, XpanClient,
    XpanError,
};
pub use progress::{CountingProgress, NullProgress, ProgressSink};
pub use token::{StaticToken, TokenError, TokenFile, TokenProvider};
