//! Filter extension points.

use std::fmt;

/// Points in the pipeline where filters run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FilterStage {
    /// Request accepted, nothing resolved yet.
    BeforeLocation,
    /// Product resolved, cluster not yet.
    FoundProduct,
    /// Cluster resolved, before the backend is contacted.
    AfterLocation,
    /// Once per attempt, after a backend was picked.
    HandleForward,
    /// Response obtained, before it is streamed.
    ReadResponse,
    /// After the response has been written.
    RequestFinish,
}

impl FilterStage {
    pub const ALL: [FilterStage; 6] = [
        FilterStage::BeforeLocation,
        FilterStage::FoundProduct,
        FilterStage::AfterLocation,
        FilterStage::HandleForward,
        FilterStage::ReadResponse,
        FilterStage::RequestFinish,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FilterStage::BeforeLocation => "before_location",
            FilterStage::FoundProduct => "found_product",
            FilterStage::AfterLocation => "after_location",
            FilterStage::HandleForward => "handle_forward",
            FilterStage::ReadResponse => "read_response",
            FilterStage::RequestFinish => "request_finish",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for FilterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
