//! Request objects flowing through the per-zone pipelines.

use dedup_index_common::{IndexError, RecordData, RecordName};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestType {
    /// Index a new chunk: report a duplicate if the name is known, and make
    /// the name current either way.
    Post,
    /// Look up, updating the mapping's metadata if found, inserting if not.
    Update,
    /// Look up only; recency is left untouched in the default
    /// configuration.
    Query,
    /// Look up with a hard guarantee of no mutation.
    QueryNoUpdate,
    /// Forget a name. Deleting an absent name succeeds with `found` false.
    Delete,
}

pub type Callback = Box<dyn FnOnce(Request) + Send>;

/// One indexing operation. Outputs (`found`, `old_metadata`, `status`) are
/// filled in by the zone thread before the callback fires on that thread.
pub struct Request {
    pub name: RecordName,
    pub new_metadata: Option<RecordData>,
    pub request_type: RequestType,
    pub found: bool,
    pub old_metadata: Option<RecordData>,
    pub status: Result<(), IndexError>,
    pub callback: Option<Callback>,
}

impl Request {
    pub fn new(request_type: RequestType, name: RecordName) -> Self {
        Request {
            name,
            new_metadata: None,
            request_type,
            found: false,
            old_metadata: None,
            status: Ok(()),
            callback: None,
        }
    }

    pub fn with_metadata(mut self, metadata: RecordData) -> Self {
        self.new_metadata = Some(metadata);
        self
    }

    pub fn with_callback(mut self, callback: Callback) -> Self {
        self.callback = Some(callback);
        self
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("type", &self.request_type)
            .field("name", &self.name)
            .field("found", &self.found)
            .field("status", &self.status)
            .finish()
    }
}
