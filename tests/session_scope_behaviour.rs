//! Behavioural coverage for session-scoped node resolution, reuse, and
//! teardown.

mod session_scope;
