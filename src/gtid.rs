//! GTID (Global Transaction ID) 관리
//!
//! GTID 형식: domain-server-sequence
//! 도메인별로 하나씩의 GTID 목록: "0-1-100,1-2-50"

use crate::error::{RelayError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

fn gtid_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)-(\d+)-(\d+)$").expect("static regex"))
}

/// 복제 위치 하나
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gtid {
    domain_id: u32,
    server_id: u32,
    sequence_nr: u64,
    valid: bool,
}

impl Gtid {
    pub fn new(domain_id: u32, server_id: u32, sequence_nr: u64) -> Self {
        Gtid {
            domain_id,
            server_id,
            sequence_nr,
            valid: true,
        }
    }

    /// GTID 문자열 파싱 (format: "domain-server-sequence")
    pub fn from_string(gtid_str: &str) -> Result<Self> {
        let caps = gtid_regex()
            .captures(gtid_str.trim())
            .ok_or_else(|| RelayError::GtidError(format!("Invalid GTID format: {}", gtid_str)))?;

        let domain_id = caps[1]
            .parse::<u32>()
            .map_err(|_| RelayError::GtidError(format!("Invalid domain: {}", &caps[1])))?;
        let server_id = caps[2]
            .parse::<u32>()
            .map_err(|_| RelayError::GtidError(format!("Invalid server id: {}", &caps[2])))?;
        let sequence_nr = caps[3]
            .parse::<u64>()
            .map_err(|_| RelayError::GtidError(format!("Invalid sequence: {}", &caps[3])))?;

        Ok(Gtid::new(domain_id, server_id, sequence_nr))
    }

    pub fn domain_id(&self) -> u32 {
        self.domain_id
    }

    pub fn server_id(&self) -> u32 {
        self.server_id
    }

    pub fn sequence_nr(&self) -> u64 {
        self.sequence_nr
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.valid {
            return Ok(());
        }
        write!(f, "{}-{}-{}", self.domain_id, self.server_id, self.sequence_nr)
    }
}

impl FromStr for Gtid {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        Gtid::from_string(s)
    }
}

/// 도메인별 GTID 목록. 항상 도메인 오름차순으로 유지된다
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GtidList {
    gtids: Vec<Gtid>,
    valid: bool,
}

impl Default for GtidList {
    fn default() -> Self {
        GtidList::new()
    }
}

impl GtidList {
    pub fn new() -> Self {
        GtidList {
            gtids: Vec::new(),
            valid: true,
        }
    }

    /// 같은 도메인의 항목을 교체하거나 새로 추가
    pub fn replace(&mut self, gtid: Gtid) {
        match self
            .gtids
            .binary_search_by_key(&gtid.domain_id(), |g| g.domain_id())
        {
            Ok(idx) => self.gtids[idx] = gtid,
            Err(idx) => self.gtids.insert(idx, gtid),
        }
        self.valid = self.valid && self.gtids.iter().all(|g| g.is_valid());
    }

    /// 파싱 실패 시 무효 목록을 돌려준다
    pub fn from_string(list_str: &str) -> Self {
        list_str.parse().unwrap_or_else(|_| GtidList {
            gtids: Vec::new(),
            valid: false,
        })
    }

    /// 도메인 오름차순으로 정렬된 GTID들
    pub fn gtids(&self) -> &[Gtid] {
        &self.gtids
    }

    pub fn get(&self, domain_id: u32) -> Option<&Gtid> {
        self.gtids
            .binary_search_by_key(&domain_id, |g| g.domain_id())
            .ok()
            .map(|idx| &self.gtids[idx])
    }

    /// 이미 같은 도메인에서 이 sequence 이상까지 기록되어 있는지
    pub fn is_covered(&self, gtid: &Gtid) -> bool {
        self.get(gtid.domain_id())
            .map(|g| g.sequence_nr() >= gtid.sequence_nr())
            .unwrap_or(false)
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_empty(&self) -> bool {
        self.gtids.is_empty()
    }

    pub fn clear(&mut self) {
        self.gtids.clear();
        self.valid = true;
    }
}

impl fmt::Display for GtidList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.gtids.iter().map(|g| g.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl FromStr for GtidList {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        let mut list = GtidList::new();
        let s = s.trim();
        if s.is_empty() {
            return Ok(list);
        }

        for token in s.split(',') {
            list.replace(Gtid::from_string(token)?);
        }
        Ok(list)
    }
}

impl From<Gtid> for GtidList {
    fn from(gtid: Gtid) -> Self {
        let mut list = GtidList::new();
        list.replace(gtid);
        list
    }
}
