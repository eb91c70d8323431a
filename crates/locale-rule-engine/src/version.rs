//! 规则版本号
//!
//! 规则版本采用 `MAJOR.MINOR.PATCH` 格式，每次更新递增 PATCH。

use crate::error::{Result, RuleError};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

pub const INITIAL_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SemVer {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// 返回 PATCH + 1 后的版本，PATCH 已达上限时返回 `None`
    pub fn bump_patch(self) -> Option<Self> {
        let patch = self.patch.checked_add(1)?;
        Some(Self { patch, ..self })
    }
}

impl FromStr for SemVer {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(RuleError::Validation(format!(
                "版本号格式应为 MAJOR.MINOR.PATCH: '{}'",
                s
            )));
        }

        let parse = |part: &str| {
            part.parse::<u64>().map_err(|_| {
                RuleError::Validation(format!("版本号包含非数字部分: '{}'", s))
            })
        };

        Ok(Self::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl PartialOrd for SemVer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SemVer {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

/// 解析版本字符串并递增 PATCH
pub fn next_version(current: &str) -> Result<String> {
    current
        .parse::<SemVer>()?
        .bump_patch()
        .map(|v| v.to_string())
        .ok_or_else(|| {
            RuleError::Validation(format!("版本号 PATCH 已达上限，无法递增: '{}'", current))
        })
}
