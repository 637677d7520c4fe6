//! Controller-facing event plumbing

pub mod event;
