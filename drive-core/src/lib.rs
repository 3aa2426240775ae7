mod client;
mod remote;

pub use client::{
    ApiErrorClass, AuthContext, DriveClient, DriveError, DriveFile, FOLDER_MIME_TYPE, FileKind,
    ListPage, SHORTCUT_MIME_TYPE, ShortcutDetails,
};
pub use remote::RemoteStore;
pub use reqwest::StatusCode;
