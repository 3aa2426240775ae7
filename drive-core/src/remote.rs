use std::future::Future;

use crate::client::{DriveClient, DriveError, DriveFile, ListPage};

/// Operations the replication engine needs from the remote store.
pub trait RemoteStore: Send + Sync {
    fn list(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> impl Future<Output = Result<ListPage, DriveError>> + Send;

    fn get_metadata(&self, id: &str) -> impl Future<Output = Result<DriveFile, DriveError>> + Send;

    fn create_folder(
        &self,
        parent_id: &str,
        name: &str,
    ) -> impl Future<Output = Result<DriveFile, DriveError>> + Send;

    /// Server-side copy; no file bytes pass through the client.
    fn copy_file(
        &self,
        file_id: &str,
        dest_parent_id: &str,
    ) -> impl Future<Output = Result<DriveFile, DriveError>> + Send;
}

impl RemoteStore for DriveClient {
    async fn list(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<ListPage, DriveError> {
        self.list_page(folder_id, page_token, page_size).await
    }

    async fn get_metadata(&self, id: &str) -> Result<DriveFile, DriveError> {
        self.get_file(id).await
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<DriveFile, DriveError> {
        DriveClient::create_folder(self, parent_id, name).await
    }

    async fn copy_file(&self, file_id: &str, dest_parent_id: &str) -> Result<DriveFile, DriveError> {
        DriveClient::copy_file(self, file_id, dest_parent_id).await
    }
}
