//! External collaborator shims (§4.9): thin TCP clients/servers translating
//! the wire protocols (§6) into and out of the pipeline's internal types.

pub mod estimate_sink;
pub mod operator;
pub mod reading_source;
