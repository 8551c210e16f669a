// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Protocol configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the write command protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// How long an originator waits for backup acknowledgments before
    /// failing the write.
    pub ack_timeout: Duration,
    /// Shard count for the in-flight invocation map. Must be a power of
    /// two. `None` uses the map's own default, sized off available
    /// parallelism.
    pub collector_shards: Option<usize>,
}

impl Default for ProtocolConfig {
    fn default() -> ProtocolConfig {
        ProtocolConfig {
            ack_timeout: Duration::from_secs(15),
            collector_shards: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout() {
        let config = ProtocolConfig::default();
        assert_eq!(config.ack_timeout, Duration::from_secs(15));
        assert_eq!(config.collector_shards, None);
    }
}
