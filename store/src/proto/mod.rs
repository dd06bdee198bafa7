#![allow(clippy::derive_partial_eq_without_eq)]

tonic::include_proto!("merklefs.tracker.v1");
