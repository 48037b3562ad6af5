//! Types and traits that are used across multiple layers of the replication pipeline.
//!
//! Types specific to a single layer live in that layer's own module, e.g.,
//! [`crate::evs::messages`] or [`crate::cache::header`].

pub mod basic;

pub mod view;

pub mod writeset;
