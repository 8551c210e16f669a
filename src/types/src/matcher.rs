// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Conditional-write decisions.
//!
//! A [`ValueMatcher`] is the single decision procedure for "does this write
//! apply, given the value currently in the cache". It reconciles three needs
//! that pull in different directions:
//!
//! * conditional operations (`replace(k, old, new)`, `remove(k, v)`,
//!   `put_if_absent`) must compare against an expected previous value;
//! * retried commands must not fail because their own first attempt already
//!   applied ([`ValueMatcher::ExpectedOrNew`]);
//! * backup owners must never re-evaluate a race the primary already
//!   resolved ([`ValueMatcher::PrimaryDecided`]).
//!
//! The matcher is evaluated exactly once per command per owner. The primary
//! evaluates it to decide; the command forwarded to backups carries
//! `PrimaryDecided` so replicas apply unconditionally.

use serde::{Deserialize, Serialize};

/// Decision mode for a conditional write. See the module docs for the role
/// each variant plays.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    proptest_derive::Arbitrary,
)]
pub enum ValueMatcher {
    /// Apply unconditionally.
    #[default]
    Always,
    /// Apply iff the current value equals the expected value. An absent
    /// expected value means "apply iff the key is absent", which is how
    /// `put_if_absent` is expressed.
    Expected,
    /// Apply iff the current value equals the expected value, or already
    /// equals the value being written. Used when a conditional command is
    /// retried: the first attempt may have applied before the response was
    /// lost, and the retry must observe that as success.
    ExpectedOrNew,
    /// Apply iff the current value equals the expected value, or the key is
    /// absent. Used by expired-entry removal, where losing the race to a
    /// concurrent explicit remove is success, not failure.
    ExpectedOrAbsent,
    /// Apply iff any value is present. Used by the two-argument
    /// `replace(k, new)`.
    Present,
    /// The primary owner already evaluated the original matcher and decided
    /// the write applies. Backup owners apply unconditionally and must not
    /// re-evaluate.
    PrimaryDecided,
}

impl ValueMatcher {
    /// Decides whether a write applies.
    ///
    /// `current` is the value presently in the cache, `expected` the value
    /// the operation compares against (absent for `put_if_absent`), and
    /// `new` the value being written (consulted only by
    /// [`ValueMatcher::ExpectedOrNew`]).
    pub fn allows_write<V: PartialEq>(
        &self,
        current: Option<&V>,
        expected: Option<&V>,
        new: Option<&V>,
    ) -> bool {
        match self {
            ValueMatcher::Always | ValueMatcher::PrimaryDecided => true,
            ValueMatcher::Expected => current == expected,
            ValueMatcher::ExpectedOrNew => current == expected || current == new,
            ValueMatcher::ExpectedOrAbsent => current.is_none() || current == expected,
            ValueMatcher::Present => current.is_some(),
        }
    }

    /// Whether this matcher makes its command conditional.
    ///
    /// Conditional commands always produce a return value, regardless of the
    /// ignore-return-values flag, because the caller needs the condition's
    /// outcome.
    pub fn is_conditional(&self) -> bool {
        match self {
            ValueMatcher::Always | ValueMatcher::PrimaryDecided => false,
            ValueMatcher::Expected
            | ValueMatcher::ExpectedOrNew
            | ValueMatcher::ExpectedOrAbsent
            | ValueMatcher::Present => true,
        }
    }

    /// The matcher a rebuilt retry of this command should carry.
    ///
    /// `Expected` relaxes to `ExpectedOrNew`; every other mode is already
    /// safe to re-evaluate.
    pub fn for_retry(&self) -> ValueMatcher {
        match self {
            ValueMatcher::Expected => ValueMatcher::ExpectedOrNew,
            other => *other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPECTED: i64 = 1;
    const OTHER: i64 = 2;
    const NEW: i64 = 3;

    // One row per (matcher, cache state): does the write apply? States are
    // absent, present-and-matching, present-with-another-value, and
    // present-with-the-new-value.
    #[test]
    fn decision_table() {
        use ValueMatcher::*;

        let cases: &[(ValueMatcher, bool, bool, bool, bool)] = &[
            // matcher, absent, matching, other, already-new
            (Always, true, true, true, true),
            (Expected, false, true, false, false),
            (ExpectedOrNew, false, true, false, true),
            (ExpectedOrAbsent, true, true, false, false),
            (Present, false, true, true, true),
            (PrimaryDecided, true, true, true, true),
        ];

        for &(matcher, absent, matching, other, already_new) in cases {
            let check = |current: Option<&i64>| {
                matcher.allows_write(current, Some(&EXPECTED), Some(&NEW))
            };
            assert_eq!(check(None), absent, "{matcher:?} vs absent");
            assert_eq!(check(Some(&EXPECTED)), matching, "{matcher:?} vs matching");
            assert_eq!(check(Some(&OTHER)), other, "{matcher:?} vs other");
            assert_eq!(check(Some(&NEW)), already_new, "{matcher:?} vs new");
        }
    }

    #[test]
    fn put_if_absent_is_expected_with_absent_expectation() {
        let matcher = ValueMatcher::Expected;
        assert!(matcher.allows_write::<i64>(None, None, Some(&NEW)));
        assert!(!matcher.allows_write(Some(&OTHER), None, Some(&NEW)));
    }

    #[test]
    fn retry_relaxation() {
        assert_eq!(
            ValueMatcher::Expected.for_retry(),
            ValueMatcher::ExpectedOrNew
        );
        for m in [
            ValueMatcher::Always,
            ValueMatcher::ExpectedOrNew,
            ValueMatcher::ExpectedOrAbsent,
            ValueMatcher::Present,
            ValueMatcher::PrimaryDecided,
        ] {
            assert_eq!(m.for_retry(), m);
        }
    }

    #[test]
    fn conditionality() {
        assert!(!ValueMatcher::Always.is_conditional());
        assert!(!ValueMatcher::PrimaryDecided.is_conditional());
        assert!(ValueMatcher::Expected.is_conditional());
        assert!(ValueMatcher::ExpectedOrNew.is_conditional());
        assert!(ValueMatcher::ExpectedOrAbsent.is_conditional());
        assert!(ValueMatcher::Present.is_conditional());
    }
}
