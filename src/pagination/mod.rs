//! Pagination over listings with no explicit end.

mod controller;
mod seen;

pub use controller::{
    PagerState, PaginationController, PaginationPolicy, PaginationReport, StopReason,
};
pub use seen::SeenSet;
