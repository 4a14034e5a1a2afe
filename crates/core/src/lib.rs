//! Generation domain model for kiln.
//!
//! Everything in this crate is pure: typed generation requests, the
//! node graph understood by ComfyUI, the workflow builder that turns a
//! request into a graph, the `${tag}` template filler for stored
//! workflows, and the job record types shared with the tracker.

pub mod builder;
pub mod error;
pub mod family;
pub mod graph;
pub mod job;
pub mod nodes;
pub mod request;
pub mod template;
pub mod types;
