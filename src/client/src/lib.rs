// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Write-path command protocol for Hoard's replicated cache.
//!
//! Every mutation of the cache is reified as a command: a self-contained
//! description of what to change, under which invocation identity, against
//! which topology generation, with which behavioral flags. Commands execute
//! on the primary owner of their key, which decides conditional outcomes and
//! forwards already-decided copies to backup owners; backups acknowledge
//! back to the originator, whose [`collector::AckCollector`] completes the
//! caller-visible future.
//!
//! The modules here cover the full life of a write:
//!
//! * [`command`]: the anatomy shared by all writes and the dispatch traits;
//! * [`write`]: put/remove/replace and friends;
//! * [`functional`]: function-carrying commands and replayable mutations;
//! * [`ack`] / [`collector`]: the backup acknowledgment protocol;
//! * [`backup`]: primary→backup fan-out over a pluggable transport;
//! * [`fencing`]: topology fencing and version-ordered invalidation.

#![warn(missing_docs)]

pub mod ack;
pub mod backup;
pub mod collector;
pub mod command;
pub mod config;
pub mod fencing;
pub mod functional;
pub mod metrics;
pub mod write;
