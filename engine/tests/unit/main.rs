//! Engine tests against the in-memory container runtime

mod support;

mod test_api;
mod test_git;
mod test_pipeline;
mod test_routing;
