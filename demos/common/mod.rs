//! Service implementations shared by the demos.

/// Echo service with a notification stream tool and a greeting resource.
pub mod echo_service;
