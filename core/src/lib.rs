//! Core types shared by every owlctl crate: the domain vocabulary of the
//! analysis service, the error taxonomy and the transport seam.

pub mod error;
pub mod job;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod transport;
pub mod types;

pub use error::{ClientError, Result};
pub use job::{Job, JobPage, PluginReport, Tag};
pub use transport::{
    ApiRequest, ApiResponse, FilePart, Method, MultipartForm, RequestBody, RequestContext,
    Transport,
};
pub use types::{Classification, JobStatus, PluginKind, Tlp};

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
