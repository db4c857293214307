//! Generated CSI v1 bindings.
//!
//! The contract lives in "proto/csi.proto" and is compiled by "tonic-build"
//! from "build.rs".

#![allow(clippy::all)]

tonic::include_proto!("csi.v1");
