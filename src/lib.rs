//! calltrace - library call tracer core
//!
//! This library provides the parts of a library-call tracer that sit on the
//! hot path of every intercepted call: deciding whether a `module!function`
//! call is traced at all, and holding each traced call until its return value
//! arrives so both are written out together.
//!
//! Interception itself (wrapping exports, decoding arguments) belongs to the
//! host instrumentation layer, which drives a [`session::TraceSession`].

pub mod cache;
pub mod cli;
pub mod config;
pub mod filter;
pub mod memory;
pub mod replay;
pub mod retval;
pub mod session;
pub mod sink;
