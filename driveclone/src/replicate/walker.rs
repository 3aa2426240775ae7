use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use drive_core::{DriveFile, FOLDER_MIME_TYPE, FileKind, RemoteStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::ledger::{LedgerError, ProgressLedger};
use super::retry::{RetryError, RetryPolicy};
use super::scheduler::{Budget, Scheduler, SchedulerError};

pub const DEFAULT_PAGE_SIZE: u32 = 1000;
const MAX_SHORTCUT_HOPS: usize = 8;

/// What to do when a folder or shortcut target disappears mid-walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NotFoundPolicy {
    Skip,
    #[default]
    Abort,
}

impl FromStr for NotFoundPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(NotFoundPolicy::Skip),
            "abort" => Ok(NotFoundPolicy::Abort),
            other => Err(format!("unknown not-found policy: {other}")),
        }
    }
}

impl fmt::Display for NotFoundPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NotFoundPolicy::Skip => "skip",
            NotFoundPolicy::Abort => "abort",
        })
    }
}

/// A listed child with shortcuts already resolved: `id` is the id of the real
/// folder or file, `shortcut_id` the shortcut it was reached through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub name: String,
    pub is_folder: bool,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub shortcut_id: Option<String>,
}

impl Entry {
    fn from_file(file: &DriveFile) -> Self {
        Self {
            id: file.id.clone(),
            name: file.name.clone(),
            is_folder: file.is_folder(),
            size: if file.is_folder() { None } else { file.size },
            shortcut_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEntry {
    Folder { parent: String, entry: Entry },
    File { parent: String, entry: Entry },
}

impl WalkEntry {
    pub fn entry(&self) -> &Entry {
        match self {
            WalkEntry::Folder { entry, .. } | WalkEntry::File { entry, .. } => entry,
        }
    }

    pub fn parent(&self) -> &str {
        match self {
            WalkEntry::Folder { parent, .. } | WalkEntry::File { parent, .. } => parent,
        }
    }
}

#[derive(Debug, Error)]
pub enum WalkError {
    #[error("listing folder {folder_id} failed: {source}")]
    Listing {
        folder_id: String,
        #[source]
        source: RetryError,
    },
    #[error("reading metadata of {id} failed: {source}")]
    Metadata {
        id: String,
        #[source]
        source: RetryError,
    },
    #[error("shortcut {id} does not resolve to a file or folder")]
    ShortcutLoop { id: String },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl WalkError {
    pub fn is_not_found(&self) -> bool {
        match self {
            WalkError::Listing { source, .. } | WalkError::Metadata { source, .. } => {
                source.is_not_found()
            }
            _ => false,
        }
    }
}

/// Fetches metadata for `id`, following shortcut chains to the real item.
pub async fn follow_shortcut<R: RemoteStore>(
    remote: &R,
    budget: &Budget,
    retry: &RetryPolicy,
    id: &str,
) -> Result<DriveFile, WalkError> {
    let mut seen = HashSet::new();
    let mut current = id.to_string();
    for _ in 0..MAX_SHORTCUT_HOPS {
        if !seen.insert(current.clone()) {
            break;
        }
        let lookup: &str = &current;
        let file = budget
            .run(retry.run("get_metadata", move || remote.get_metadata(lookup)))
            .await?
            .map_err(|source| WalkError::Metadata {
                id: current.clone(),
                source,
            })?;
        match file.kind() {
            FileKind::Shortcut { target_id, .. } => current = target_id,
            FileKind::Folder | FileKind::File => return Ok(file),
        }
    }
    Err(WalkError::ShortcutLoop { id: id.to_string() })
}

struct FolderListing {
    folder_id: String,
    entries: Vec<Entry>,
    skipped: usize,
    result: Result<(), WalkError>,
}

/// Breadth-first enumeration of a folder tree. Children of a folder are only
/// listed once the caller asks for it with [`Walk::descend`].
pub struct FolderWalker<R> {
    remote: Arc<R>,
    budget: Budget,
    retry: RetryPolicy,
    page_size: u32,
    not_found: NotFoundPolicy,
    cache: Option<ProgressLedger>,
    refresh: bool,
}

impl<R> Clone for FolderWalker<R> {
    fn clone(&self) -> Self {
        Self {
            remote: Arc::clone(&self.remote),
            budget: self.budget.clone(),
            retry: self.retry,
            page_size: self.page_size,
            not_found: self.not_found,
            cache: self.cache.clone(),
            refresh: self.refresh,
        }
    }
}

impl<R: RemoteStore + 'static> FolderWalker<R> {
    pub fn new(remote: Arc<R>, budget: Budget, retry: RetryPolicy) -> Self {
        Self {
            remote,
            budget,
            retry,
            page_size: DEFAULT_PAGE_SIZE,
            not_found: NotFoundPolicy::default(),
            cache: None,
            refresh: false,
        }
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, 1000);
        self
    }

    pub fn not_found(mut self, policy: NotFoundPolicy) -> Self {
        self.not_found = policy;
        self
    }

    /// Reads complete listings from `ledger` unless `refresh` is set, and
    /// stores every freshly listed folder there.
    pub fn listing_cache(mut self, ledger: ProgressLedger, refresh: bool) -> Self {
        self.cache = Some(ledger);
        self.refresh = refresh;
        self
    }

    pub fn walk(&self, root: &str) -> Walk<R> {
        let mut walk = Walk {
            walker: self.clone(),
            listings: Scheduler::new(self.budget.clone()),
            ready: VecDeque::new(),
            seen_folders: HashSet::from([root.to_string()]),
            descended: HashSet::new(),
            skipped: 0,
        };
        walk.descend(root);
        walk
    }
}

pub struct Walk<R> {
    walker: FolderWalker<R>,
    listings: Scheduler<FolderListing>,
    ready: VecDeque<WalkEntry>,
    seen_folders: HashSet<String>,
    descended: HashSet<String>,
    skipped: usize,
}

impl<R: RemoteStore + 'static> Walk<R> {
    /// Schedules the listing of `folder_id`. Repeated calls are ignored.
    pub fn descend(&mut self, folder_id: &str) {
        if !self.descended.insert(folder_id.to_string()) {
            return;
        }
        let walker = self.walker.clone();
        let folder_id = folder_id.to_string();
        self.listings
            .submit_metered(move |budget| list_folder(walker, budget, folder_id));
    }

    /// No listing in flight and nothing buffered. More entries can only
    /// appear after another [`Walk::descend`].
    pub fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.listings.is_empty()
    }

    /// Folders and shortcut targets dropped under [`NotFoundPolicy::Skip`].
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Next discovered entry, or `None` when the walk is idle. Cancel safe.
    pub async fn next(&mut self) -> Result<Option<WalkEntry>, WalkError> {
        loop {
            if let Some(entry) = self.ready.pop_front() {
                return Ok(Some(entry));
            }
            let Some(done) = self.listings.next_completed().await else {
                return Ok(None);
            };
            let listing = done?;
            self.skipped += listing.skipped;

            match listing.result {
                Ok(()) => {}
                Err(err) if err.is_not_found() && self.walker.not_found == NotFoundPolicy::Skip => {
                    warn!(folder = %listing.folder_id, error = %err, "skipping missing folder");
                    self.skipped += 1;
                    continue;
                }
                Err(err) => return Err(err),
            }

            for entry in listing.entries {
                if entry.is_folder {
                    if !self.seen_folders.insert(entry.id.clone()) {
                        warn!(
                            folder = %entry.id,
                            parent = %listing.folder_id,
                            "folder reached twice, not following it again"
                        );
                        continue;
                    }
                    self.ready.push_back(WalkEntry::Folder {
                        parent: listing.folder_id.clone(),
                        entry,
                    });
                } else {
                    self.ready.push_back(WalkEntry::File {
                        parent: listing.folder_id.clone(),
                        entry,
                    });
                }
            }
        }
    }
}

async fn list_folder<R: RemoteStore>(
    walker: FolderWalker<R>,
    budget: Budget,
    folder_id: String,
) -> FolderListing {
    let mut listing = FolderListing {
        folder_id,
        entries: Vec::new(),
        skipped: 0,
        result: Ok(()),
    };
    if let Err(err) = fill_listing(&walker, &budget, &mut listing).await {
        listing.entries.clear();
        listing.result = Err(err);
    }
    listing
}

async fn fill_listing<R: RemoteStore>(
    walker: &FolderWalker<R>,
    budget: &Budget,
    listing: &mut FolderListing,
) -> Result<(), WalkError> {
    if let Some(cache) = walker.cache.as_ref().filter(|_| !walker.refresh) {
        if let Some(entries) = cache.cached_listing(&listing.folder_id).await? {
            debug!(folder = %listing.folder_id, entries = entries.len(), "listing served from cache");
            listing.entries = entries;
            return Ok(());
        }
    }

    let remote: &R = &walker.remote;
    let folder: &str = &listing.folder_id;
    let page_size = walker.page_size;
    let mut page_token: Option<String> = None;
    let mut pages = 0u32;
    loop {
        let token = page_token.as_deref();
        let page = budget
            .run(walker.retry.run("list", move || remote.list(folder, token, page_size)))
            .await?
            .map_err(|source| WalkError::Listing {
                folder_id: folder.to_string(),
                source,
            })?;
        pages += 1;

        for file in page.files {
            match resolve_entry(walker, budget, file).await {
                Ok(entry) => listing.entries.push(entry),
                Err(err) if err.is_not_found() && walker.not_found == NotFoundPolicy::Skip => {
                    warn!(folder = %folder, error = %err, "skipping broken shortcut");
                    listing.skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }

        match page.next_page_token {
            Some(next) => page_token = Some(next),
            None => break,
        }
    }
    debug!(folder = %folder, pages, entries = listing.entries.len(), "folder listed");

    if listing.skipped == 0 {
        if let Some(cache) = &walker.cache {
            cache.store_listing(folder, &listing.entries).await?;
        }
    }
    Ok(())
}

async fn resolve_entry<R: RemoteStore>(
    walker: &FolderWalker<R>,
    budget: &Budget,
    file: DriveFile,
) -> Result<Entry, WalkError> {
    let FileKind::Shortcut {
        target_id,
        target_mime_type,
    } = file.kind()
    else {
        return Ok(Entry::from_file(&file));
    };

    if target_mime_type.as_deref() == Some(FOLDER_MIME_TYPE) {
        return Ok(Entry {
            id: target_id,
            name: file.name,
            is_folder: true,
            size: None,
            shortcut_id: Some(file.id),
        });
    }

    let target = follow_shortcut(walker.remote.as_ref(), budget, &walker.retry, &target_id).await?;
    Ok(Entry {
        name: file.name,
        shortcut_id: Some(file.id),
        ..Entry::from_file(&target)
    })
}
