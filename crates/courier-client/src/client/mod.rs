// Client-side modules for dispatch, feedback, and the service façade.
pub mod dispatch;
pub mod feedback;
pub mod service;
