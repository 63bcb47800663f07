pub mod enrichment_queue;
pub mod event;
pub mod event_vector;
pub mod external_entity;
pub mod integration;
pub mod member;
pub mod organization;
