//! Genesys Cloud integration: notification connector and topic builder

pub mod connector;
pub mod normalize;
pub mod topics;
