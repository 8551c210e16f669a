// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Shared data model for Hoard's write-path command protocol.
//!
//! Every mutation of a replicated cache is reified as a command object, and
//! the pieces of state those commands carry live here: behavioral flags, the
//! invocation identity that names a write for locking and acknowledgment,
//! the conditional-write matcher, topology and segment identifiers, clustered
//! entry versions, and the cache entry/metadata payloads themselves.
//!
//! Types in this crate are plain data: cheap to clone, totally serializable,
//! and free of I/O. The command structures that bind them together live in
//! `hoard-client`.

#![warn(missing_docs)]

pub mod entry;
pub mod flags;
pub mod id;
pub mod matcher;
pub mod topology;
pub mod version;
