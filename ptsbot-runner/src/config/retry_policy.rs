// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::Deserialize;
use std::{cmp::Ordering, fmt, time::Duration};

/// Type for the `run.retry` config key.
///
/// Failed and inconclusive attempts are retried identically. There is no backoff: attempts
/// are bounded by device I/O, not by a remote service that needs to recover.
#[derive(Debug, Copy, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RetryPolicy {
    /// Maximum number of additional attempts after the first.
    pub count: u32,

    /// Delay between attempts.
    #[serde(default, with = "humantime_serde")]
    pub delay: Duration,
}

impl RetryPolicy {
    /// Creates a new policy with no delay between attempts.
    pub fn new_without_delay(count: u32) -> Self {
        Self {
            count,
            delay: Duration::ZERO,
        }
    }

    /// Returns the maximum total number of attempts for a test case.
    pub fn max_attempts(&self) -> u32 {
        self.count.saturating_add(1)
    }
}

pub(super) fn deserialize_retry_policy<'de, D>(deserializer: D) -> Result<RetryPolicy, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct V;

    impl<'de2> serde::de::Visitor<'de2> for V {
        type Value = RetryPolicy;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(
                formatter,
                "a table ({{ count = 2, delay = \"1s\" }}) or a number (2)"
            )
        }

        // Note that TOML uses i64, not u64.
        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            match v.cmp(&0) {
                Ordering::Greater | Ordering::Equal => {
                    let v = u32::try_from(v).map_err(|_| {
                        serde::de::Error::invalid_value(
                            serde::de::Unexpected::Signed(v),
                            &"a positive u32",
                        )
                    })?;
                    Ok(RetryPolicy::new_without_delay(v))
                }
                Ordering::Less => Err(serde::de::Error::invalid_value(
                    serde::de::Unexpected::Signed(v),
                    &self,
                )),
            }
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            let v = u32::try_from(v).map_err(|_| {
                serde::de::Error::invalid_value(serde::de::Unexpected::Unsigned(v), &"a u32")
            })?;
            Ok(RetryPolicy::new_without_delay(v))
        }

        fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
        where
            A: serde::de::MapAccess<'de2>,
        {
            RetryPolicy::deserialize(serde::de::value::MapAccessDeserializer::new(map))
        }
    }

    deserializer.deserialize_any(V)
}
