//! Bounded large-key analysis and single-key inspection.
//!
//! The scan walks the keyspace with cursor-based `SCAN` pages, filters key
//! names against the glob locally, sizes each match through a pluggable
//! [`SizeEstimator`], and folds the results into a [`ScanAccumulator`].
//! Every key a page returns is charged against the budget whether or not it
//! matches, so a selective pattern cannot turn a bounded scan into a full
//! keyspace walk.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use redis::Value;
use serde::Serialize;

use crate::cluster::{NodeFailure, unreachable_masters};
use crate::config::{RedisMode, ScanSettings};
use crate::connection::{ConnectionManager, Lease};
use crate::error::RedisOpsError;
use crate::executor::{normalize_value, value_text};
use crate::format::format_bytes;

/// Upper bound on SCAN round trips per node, whatever the budget.
const MAX_SCAN_ITERATIONS: usize = 10_000;
/// Elements sampled when estimating a collection from its length.
const SAMPLE_ELEMENTS: usize = 10;
/// Elements shown in a key preview.
const PREVIEW_ELEMENTS: usize = 10;
/// Bytes shown in a string preview.
const PREVIEW_BYTES: i64 = 256;

/// The commands the scanner needs from one node.
#[async_trait]
pub trait Keyspace: Send {
    /// One unfiltered `SCAN` page: next cursor (0 when done) and raw key
    /// names, which need not be UTF-8.
    async fn scan_page(
        &mut self,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<Vec<u8>>), RedisOpsError>;

    /// `TYPE` of each key, in order. Missing keys report `"none"`.
    async fn key_types(&mut self, keys: &[String]) -> Result<Vec<String>, RedisOpsError>;

    /// Remaining TTL in seconds; -1 without expiry, -2 when missing.
    async fn ttl(&mut self, key: &str) -> Result<i64, RedisOpsError>;

    /// Server-reported footprint, `None` if the key is gone.
    async fn memory_usage(&mut self, key: &str) -> Result<Option<u64>, RedisOpsError>;

    /// Byte length for strings, element count for collections.
    async fn element_count(&mut self, key: &str, key_type: &str) -> Result<u64, RedisOpsError>;

    /// Byte sizes of up to `n` elements of a collection.
    async fn sample_sizes(
        &mut self,
        key: &str,
        key_type: &str,
        n: usize,
    ) -> Result<Vec<u64>, RedisOpsError>;
}

/// Strategy for sizing one key. Results are estimates.
#[async_trait]
pub trait SizeEstimator: Send + Sync {
    /// Label reported as `size_source`.
    fn source(&self) -> &'static str;

    async fn estimate(
        &self,
        keyspace: &mut dyn Keyspace,
        key: &str,
        key_type: &str,
    ) -> Result<Option<u64>, RedisOpsError>;
}

/// Key name plus payload: string length, or element count times the average
/// size of a few sampled elements.
pub struct LengthEstimator;

#[async_trait]
impl SizeEstimator for LengthEstimator {
    fn source(&self) -> &'static str {
        "length_estimate"
    }

    async fn estimate(
        &self,
        keyspace: &mut dyn Keyspace,
        key: &str,
        key_type: &str,
    ) -> Result<Option<u64>, RedisOpsError> {
        let count = keyspace.element_count(key, key_type).await?;
        let payload = if key_type == "string" || count == 0 {
            count
        } else {
            let sizes = keyspace
                .sample_sizes(key, key_type, SAMPLE_ELEMENTS)
                .await?;
            if sizes.is_empty() {
                0
            } else {
                let average = sizes.iter().sum::<u64>() / sizes.len() as u64;
                count.saturating_mul(average)
            }
        };
        Ok(Some(key.len() as u64 + payload))
    }
}

/// `MEMORY USAGE`, falling back to [`LengthEstimator`] for the rest of the
/// scan once the server rejects the command.
#[derive(Default)]
pub struct MemoryUsageEstimator {
    unsupported: AtomicBool,
}

#[async_trait]
impl SizeEstimator for MemoryUsageEstimator {
    fn source(&self) -> &'static str {
        if self.unsupported.load(Ordering::Relaxed) {
            "length_estimate (MEMORY USAGE unavailable)"
        } else {
            "memory_usage"
        }
    }

    async fn estimate(
        &self,
        keyspace: &mut dyn Keyspace,
        key: &str,
        key_type: &str,
    ) -> Result<Option<u64>, RedisOpsError> {
        if !self.unsupported.load(Ordering::Relaxed) {
            match keyspace.memory_usage(key).await {
                Ok(bytes) => return Ok(bytes),
                Err(RedisOpsError::Command(msg)) if is_unknown_command(&msg) => {
                    tracing::warn!(error = %msg, "MEMORY USAGE rejected, estimating from length");
                    self.unsupported.store(true, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            }
        }
        LengthEstimator.estimate(keyspace, key, key_type).await
    }
}

fn is_unknown_command(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("unknown command") || msg.contains("unknown subcommand")
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyRecord {
    pub key: String,
    #[serde(rename = "type")]
    pub key_type: String,
    pub size_bytes: u64,
    pub size_formatted: String,
    /// `None` means no expiry.
    pub ttl_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypeStats {
    pub count: u64,
    pub total_bytes: u64,
    pub max_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub pattern: String,
    pub large_keys: Vec<KeyRecord>,
    /// Every key at or above the threshold, including those past the list cap.
    pub large_keys_found: usize,
    pub type_stats: BTreeMap<String, TypeStats>,
    /// Keys examined, matching or not. Never more than the budget.
    pub keys_scanned: usize,
    /// Examined keys that matched the pattern.
    pub keys_matched: usize,
    /// Matching keys that could not be sized or have non-UTF-8 names.
    pub keys_skipped: usize,
    pub truncated: bool,
    pub threshold_bytes: u64,
    pub threshold_formatted: String,
    pub size_source: String,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nodes_scanned: Vec<String>,
    /// Masters that could not be scanned; their keys are missing.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_nodes: Vec<NodeFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Candidate {
    size: u64,
    key: String,
    key_type: String,
    ttl: Option<i64>,
}

/// Running state of one analysis: a min-heap keeping the largest
/// `capacity` keys at or above the threshold, and per-type totals over
/// every key seen.
pub struct ScanAccumulator {
    threshold: u64,
    capacity: usize,
    largest: BinaryHeap<Reverse<Candidate>>,
    type_stats: BTreeMap<String, TypeStats>,
    pub keys_scanned: usize,
    pub keys_matched: usize,
    pub keys_skipped: usize,
    pub large_keys_found: usize,
}

impl ScanAccumulator {
    pub fn new(threshold: u64, capacity: usize) -> Self {
        Self {
            threshold,
            capacity,
            largest: BinaryHeap::new(),
            type_stats: BTreeMap::new(),
            keys_scanned: 0,
            keys_matched: 0,
            keys_skipped: 0,
            large_keys_found: 0,
        }
    }

    pub fn is_large(&self, size: u64) -> bool {
        size >= self.threshold
    }

    pub fn record(&mut self, key: &str, key_type: &str, size: u64, ttl: Option<i64>) {
        let stats = self.type_stats.entry(key_type.to_string()).or_default();
        stats.count += 1;
        stats.total_bytes = stats.total_bytes.saturating_add(size);
        stats.max_bytes = stats.max_bytes.max(size);

        if !self.is_large(size) {
            return;
        }
        self.large_keys_found += 1;
        self.largest.push(Reverse(Candidate {
            size,
            key: key.to_string(),
            key_type: key_type.to_string(),
            ttl,
        }));
        if self.largest.len() > self.capacity {
            self.largest.pop();
        }
    }

    pub fn into_report(
        self,
        pattern: &str,
        truncated: bool,
        size_source: &str,
        elapsed_ms: f64,
        nodes_scanned: Vec<String>,
        failed_nodes: Vec<NodeFailure>,
    ) -> ScanReport {
        // Ascending order of `Reverse` is descending size.
        let large_keys = self
            .largest
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(c)| KeyRecord {
                size_formatted: format_bytes(c.size),
                key: c.key,
                key_type: c.key_type,
                size_bytes: c.size,
                ttl_seconds: c.ttl,
                preview: None,
            })
            .collect();
        ScanReport {
            pattern: pattern.to_string(),
            large_keys,
            large_keys_found: self.large_keys_found,
            type_stats: self.type_stats,
            keys_scanned: self.keys_scanned,
            keys_matched: self.keys_matched,
            keys_skipped: self.keys_skipped,
            truncated: truncated || !failed_nodes.is_empty(),
            threshold_bytes: self.threshold,
            threshold_formatted: format_bytes(self.threshold),
            size_source: size_source.to_string(),
            elapsed_ms,
            nodes_scanned,
            failed_nodes,
        }
    }
}

/// Walk one keyspace until it is exhausted or `budget` keys have been
/// examined in total. Returns `true` when the keyspace was exhausted.
pub async fn scan_keyspace(
    keyspace: &mut dyn Keyspace,
    estimator: &dyn SizeEstimator,
    pattern: &str,
    scan_count: usize,
    budget: usize,
    acc: &mut ScanAccumulator,
) -> Result<bool, RedisOpsError> {
    let mut cursor = 0;
    for _ in 0..MAX_SCAN_ITERATIONS {
        let remaining = budget.saturating_sub(acc.keys_scanned);
        if remaining == 0 {
            return Ok(false);
        }
        let (next, mut page) = keyspace.scan_page(cursor, scan_count).await?;
        let cut = page.len() > remaining;
        page.truncate(remaining);
        acc.keys_scanned += page.len();

        let keys = matching_keys(page, pattern, acc);
        if !keys.is_empty() {
            let types = keyspace.key_types(&keys).await?;
            for (key, key_type) in keys.iter().zip(types) {
                // Expired or deleted since the SCAN.
                if key_type == "none" {
                    continue;
                }
                let size = match estimator.estimate(keyspace, key, &key_type).await {
                    Ok(Some(size)) => size,
                    Ok(None) => continue,
                    Err(e) if e.is_connection() => return Err(e),
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Skipping key");
                        acc.keys_skipped += 1;
                        continue;
                    }
                };
                let ttl = if acc.is_large(size) {
                    tracing::debug!(key = %key, size, "Large key");
                    match keyspace.ttl(key).await {
                        Ok(ttl) if ttl >= 0 => Some(ttl),
                        Ok(_) => None,
                        Err(e) if e.is_connection() => return Err(e),
                        Err(_) => None,
                    }
                } else {
                    None
                };
                acc.record(key, &key_type, size, ttl);
            }
        }

        if cut {
            return Ok(false);
        }
        if next == 0 {
            return Ok(true);
        }
        cursor = next;
    }
    tracing::warn!(iterations = MAX_SCAN_ITERATIONS, "Scan iteration cap reached");
    Ok(false)
}

/// Names on `page` that match `pattern`. Matching names that are not UTF-8
/// are counted as skipped.
fn matching_keys(page: Vec<Vec<u8>>, pattern: &str, acc: &mut ScanAccumulator) -> Vec<String> {
    let mut keys = Vec::new();
    for raw in page {
        if !glob_match(pattern.as_bytes(), &raw) {
            continue;
        }
        acc.keys_matched += 1;
        match String::from_utf8(raw) {
            Ok(key) => keys.push(key),
            Err(e) => {
                tracing::warn!(
                    key = %String::from_utf8_lossy(e.as_bytes()),
                    "Skipping key with a non-UTF-8 name"
                );
                acc.keys_skipped += 1;
            }
        }
    }
    keys
}

/// Redis glob matching over raw bytes: `*`, `?`, `[...]` classes with `^`
/// negation and `a-z` ranges, and `\` escapes.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    // Pattern position after the last `*`, and the text position it resumes at.
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if pattern.get(p) == Some(&b'*') {
            p += 1;
            star = Some((p, t));
            continue;
        }
        if let Some(width) = token_width(&pattern[p..], text[t]) {
            p += width;
            t += 1;
            continue;
        }
        match star {
            Some((resume, from)) => {
                p = resume;
                t = from + 1;
                star = Some((resume, t));
            }
            None => return false,
        }
    }
    pattern[p..].iter().all(|b| *b == b'*')
}

/// Pattern bytes consumed if the token at the start of `pattern` matches `c`.
fn token_width(pattern: &[u8], c: u8) -> Option<usize> {
    match pattern {
        [] => None,
        [b'?', ..] => Some(1),
        [b'\\', escaped, ..] => (*escaped == c).then_some(2),
        [b'[', ..] => class_width(pattern, c),
        [literal, ..] => (*literal == c).then_some(1),
    }
}

fn class_width(pattern: &[u8], c: u8) -> Option<usize> {
    let mut i = 1;
    let negate = pattern.get(i) == Some(&b'^');
    if negate {
        i += 1;
    }
    let mut matched = false;
    loop {
        match pattern[i..] {
            [] => return None,
            [b']', ..] => break,
            [b'\\', escaped, ..] => {
                matched |= escaped == c;
                i += 2;
            }
            [lo, b'-', hi, ..] if hi != b']' => {
                let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
                matched |= (lo..=hi).contains(&c);
                i += 3;
            }
            [b, ..] => {
                matched |= b == c;
                i += 1;
            }
        }
    }
    (matched != negate).then_some(i + 1)
}

/// Reject patterns the glob would misread: empty, NUL bytes, unclosed `[`.
pub fn validate_pattern(pattern: &str) -> Result<(), RedisOpsError> {
    if pattern.is_empty() {
        return Err(RedisOpsError::Validation(
            "pattern must not be empty".to_string(),
        ));
    }
    if pattern.contains('\0') {
        return Err(RedisOpsError::Validation(
            "pattern must not contain null bytes".to_string(),
        ));
    }
    let mut chars = pattern.chars();
    let mut open = false;
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '[' if !open => open = true,
            ']' if open => open = false,
            _ => {}
        }
    }
    if open {
        return Err(RedisOpsError::Validation(format!(
            "pattern '{pattern}' has an unclosed '['"
        )));
    }
    Ok(())
}

/// Total bulk-string bytes in a reply.
fn value_bytes(value: &Value) -> u64 {
    match value {
        Value::BulkString(bytes) => bytes.len() as u64,
        Value::SimpleString(s) => s.len() as u64,
        Value::Int(_) | Value::Double(_) => 8,
        Value::Array(items) | Value::Set(items) => items.iter().map(value_bytes).sum(),
        Value::Map(pairs) => pairs
            .iter()
            .map(|(k, v)| value_bytes(k) + value_bytes(v))
            .sum(),
        _ => 0,
    }
}

/// [`Keyspace`] over one leased connection.
pub struct RedisKeyspace {
    lease: Lease,
}

impl RedisKeyspace {
    pub fn new(lease: Lease) -> Self {
        Self { lease }
    }

    pub fn generation(&self) -> u64 {
        self.lease.generation()
    }

    async fn encoding(&mut self, key: &str) -> Option<String> {
        let mut cmd = redis::cmd("OBJECT");
        cmd.arg("ENCODING").arg(key);
        self.lease.query::<Option<String>>(&cmd).await.ok().flatten()
    }

    /// A bounded look at the value: never more than [`PREVIEW_BYTES`] of a
    /// string or [`PREVIEW_ELEMENTS`] elements of a collection.
    async fn preview(
        &mut self,
        key: &str,
        key_type: &str,
    ) -> Result<serde_json::Value, RedisOpsError> {
        let limit = PREVIEW_ELEMENTS as i64;
        let cmd = match key_type {
            "string" => {
                let mut cmd = redis::cmd("GETRANGE");
                cmd.arg(key).arg(0).arg(PREVIEW_BYTES - 1);
                cmd
            }
            "list" => {
                let mut cmd = redis::cmd("LRANGE");
                cmd.arg(key).arg(0).arg(limit - 1);
                cmd
            }
            "zset" => {
                let mut cmd = redis::cmd("ZRANGE");
                cmd.arg(key).arg(0).arg(limit - 1).arg("WITHSCORES");
                cmd
            }
            "stream" => {
                let mut cmd = redis::cmd("XRANGE");
                cmd.arg(key).arg("-").arg("+").arg("COUNT").arg(limit);
                cmd
            }
            "set" => {
                let mut cmd = redis::cmd("SSCAN");
                cmd.arg(key).arg(0).arg("COUNT").arg(limit);
                cmd
            }
            "hash" => {
                let mut cmd = redis::cmd("HSCAN");
                cmd.arg(key).arg(0).arg("COUNT").arg(limit);
                cmd
            }
            _ => return Ok(serde_json::Value::Null),
        };

        match key_type {
            "set" => {
                let (_, members): (u64, Vec<Value>) = self.lease.query(&cmd).await?;
                Ok(serde_json::Value::Array(
                    members.iter().take(PREVIEW_ELEMENTS).map(normalize_value).collect(),
                ))
            }
            "hash" => {
                let (_, flat): (u64, Vec<Value>) = self.lease.query(&cmd).await?;
                let fields = flat
                    .chunks(2)
                    .take(PREVIEW_ELEMENTS)
                    .filter_map(|pair| match pair {
                        [field, value] => Some((
                            value_text(field).unwrap_or_else(|| normalize_value(field).to_string()),
                            normalize_value(value),
                        )),
                        _ => None,
                    })
                    .collect();
                Ok(serde_json::Value::Object(fields))
            }
            _ => {
                let reply: Value = self.lease.query(&cmd).await?;
                Ok(normalize_value(&reply))
            }
        }
    }
}

fn keyed(name: &str, key: &str) -> redis::Cmd {
    let mut cmd = redis::cmd(name);
    cmd.arg(key);
    cmd
}

#[async_trait]
impl Keyspace for RedisKeyspace {
    async fn scan_page(
        &mut self,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<Vec<u8>>), RedisOpsError> {
        // No MATCH: the server would filter after examining, hiding how much
        // of the budget a page really used.
        let mut cmd = redis::cmd("SCAN");
        cmd.arg(cursor).arg("COUNT").arg(count);
        self.lease.query(&cmd).await
    }

    async fn key_types(&mut self, keys: &[String]) -> Result<Vec<String>, RedisOpsError> {
        // One round trip for the whole page instead of one TYPE per key.
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("TYPE").arg(key);
        }
        let replies = self.lease.pipeline(&pipe).await?;
        Ok(replies
            .iter()
            .map(|reply| value_text(reply).unwrap_or_else(|| "unknown".to_string()))
            .collect())
    }

    async fn ttl(&mut self, key: &str) -> Result<i64, RedisOpsError> {
        self.lease.query(&keyed("TTL", key)).await
    }

    async fn memory_usage(&mut self, key: &str) -> Result<Option<u64>, RedisOpsError> {
        let mut cmd = redis::cmd("MEMORY");
        cmd.arg("USAGE").arg(key);
        self.lease.query(&cmd).await
    }

    async fn element_count(&mut self, key: &str, key_type: &str) -> Result<u64, RedisOpsError> {
        let name = match key_type {
            "string" => "STRLEN",
            "list" => "LLEN",
            "set" => "SCARD",
            "zset" => "ZCARD",
            "hash" => "HLEN",
            "stream" => "XLEN",
            _ => return Ok(0),
        };
        self.lease.query(&keyed(name, key)).await
    }

    async fn sample_sizes(
        &mut self,
        key: &str,
        key_type: &str,
        n: usize,
    ) -> Result<Vec<u64>, RedisOpsError> {
        let last = n.saturating_sub(1);
        match key_type {
            "list" => {
                let mut cmd = keyed("LRANGE", key);
                cmd.arg(0).arg(last);
                let items: Vec<Vec<u8>> = self.lease.query(&cmd).await?;
                Ok(items.iter().map(|i| i.len() as u64).collect())
            }
            "set" => {
                let mut cmd = keyed("SRANDMEMBER", key);
                cmd.arg(n);
                let items: Vec<Vec<u8>> = self.lease.query(&cmd).await?;
                Ok(items.iter().map(|i| i.len() as u64).collect())
            }
            "zset" => {
                let mut cmd = keyed("ZRANGE", key);
                cmd.arg(0).arg(last);
                let items: Vec<Vec<u8>> = self.lease.query(&cmd).await?;
                // Each member also carries an 8-byte score.
                Ok(items.iter().map(|i| i.len() as u64 + 8).collect())
            }
            "hash" => {
                let mut cmd = keyed("HSCAN", key);
                cmd.arg(0).arg("COUNT").arg(n);
                let (_, flat): (u64, Vec<Vec<u8>>) = self.lease.query(&cmd).await?;
                Ok(flat
                    .chunks(2)
                    .take(n)
                    .map(|pair| pair.iter().map(|p| p.len() as u64).sum())
                    .collect())
            }
            "stream" => {
                let mut cmd = keyed("XRANGE", key);
                cmd.arg("-").arg("+").arg("COUNT").arg(n);
                let entries: Vec<Value> = self.lease.query(&cmd).await?;
                Ok(entries.iter().map(value_bytes).collect())
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyDetails {
    pub key: String,
    #[serde(rename = "type")]
    pub key_type: String,
    pub size_bytes: u64,
    pub size_formatted: String,
    pub size_source: String,
    pub is_large: bool,
    pub ttl_seconds: Option<i64>,
    pub encoding: Option<String>,
    pub element_count: u64,
    pub preview: serde_json::Value,
    pub preview_truncated: bool,
}

#[derive(Debug, Default)]
struct MasterScan {
    exhausted: bool,
    nodes_scanned: Vec<String>,
    failed_nodes: Vec<NodeFailure>,
}

pub struct KeyScanner {
    manager: Arc<ConnectionManager>,
    settings: ScanSettings,
}

impl KeyScanner {
    pub fn new(manager: Arc<ConnectionManager>, settings: ScanSettings) -> Self {
        Self { manager, settings }
    }

    /// Find keys at or above the large-key threshold among keys matching
    /// `pattern`, examining at most `limit` keys (and never more than the
    /// configured cap).
    pub async fn analyze(
        &self,
        pattern: &str,
        limit: Option<usize>,
        include_memory_usage: bool,
    ) -> Result<ScanReport, RedisOpsError> {
        validate_pattern(pattern)?;
        if limit == Some(0) {
            return Err(RedisOpsError::Validation(
                "limit must be at least 1".to_string(),
            ));
        }
        let budget = limit.map_or(self.settings.max_scan_keys, |l| {
            l.min(self.settings.max_scan_keys)
        });
        let estimator: Box<dyn SizeEstimator> = if include_memory_usage {
            Box::new(MemoryUsageEstimator::default())
        } else {
            Box::new(LengthEstimator)
        };

        let started = Instant::now();
        let mut acc =
            ScanAccumulator::new(self.settings.large_key_threshold, self.settings.max_large_keys);
        let (exhausted, nodes) = match self.manager.mode() {
            RedisMode::Cluster => {
                let masters = self.manager.master_addresses().await?;
                let scan = self
                    .scan_masters(masters, estimator.as_ref(), pattern, budget, &mut acc)
                    .await;
                if scan.nodes_scanned.is_empty() && !scan.failed_nodes.is_empty() {
                    return Err(unreachable_masters(&scan.failed_nodes));
                }
                (scan.exhausted, scan)
            }
            RedisMode::Single | RedisMode::Sentinel => {
                let mut keyspace = RedisKeyspace::new(self.manager.get_handle().await?);
                let result = scan_keyspace(
                    &mut keyspace,
                    estimator.as_ref(),
                    pattern,
                    self.settings.scan_count,
                    budget,
                    &mut acc,
                )
                .await;
                if let Err(e) = &result {
                    self.manager.observe(keyspace.generation(), e).await;
                }
                (result?, MasterScan::default())
            }
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        tracing::info!(
            pattern = %pattern,
            keys_scanned = acc.keys_scanned,
            keys_matched = acc.keys_matched,
            large_keys = acc.large_keys_found,
            truncated = !exhausted,
            elapsed_ms,
            "Large key analysis finished"
        );
        Ok(acc.into_report(
            pattern,
            !exhausted,
            estimator.source(),
            elapsed_ms,
            nodes.nodes_scanned,
            nodes.failed_nodes,
        ))
    }

    /// SCAN is node-local, so every master is walked directly. A master that
    /// cannot be reached is recorded and the walk moves on to the next one.
    async fn scan_masters(
        &self,
        masters: Vec<String>,
        estimator: &dyn SizeEstimator,
        pattern: &str,
        budget: usize,
        acc: &mut ScanAccumulator,
    ) -> MasterScan {
        let mut scan = MasterScan {
            exhausted: true,
            ..Default::default()
        };
        for address in masters {
            let result = match self.manager.node_handle(&address).await {
                Ok(lease) => {
                    let mut keyspace = RedisKeyspace::new(lease);
                    scan_keyspace(
                        &mut keyspace,
                        estimator,
                        pattern,
                        self.settings.scan_count,
                        budget,
                        acc,
                    )
                    .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(done) => {
                    scan.nodes_scanned.push(address);
                    if !done {
                        scan.exhausted = false;
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(node = %address, error = %e, "Master skipped during scan");
                    scan.exhausted = false;
                    scan.failed_nodes.push(NodeFailure::new(address, &e));
                }
            }
        }
        scan
    }

    /// Type, size, TTL, encoding and a bounded preview of one key.
    pub async fn get_key_details(&self, key: &str) -> Result<KeyDetails, RedisOpsError> {
        if key.is_empty() {
            return Err(RedisOpsError::Validation("key must not be empty".to_string()));
        }
        let mut keyspace = RedisKeyspace::new(self.manager.get_handle().await?);
        let result = self.inspect(&mut keyspace, key).await;
        if let Err(e) = &result {
            self.manager.observe(keyspace.generation(), e).await;
        }
        result
    }

    async fn inspect(
        &self,
        keyspace: &mut RedisKeyspace,
        key: &str,
    ) -> Result<KeyDetails, RedisOpsError> {
        let key_type = keyspace
            .key_types(&[key.to_string()])
            .await?
            .pop()
            .unwrap_or_else(|| "none".to_string());
        if key_type == "none" {
            return Err(RedisOpsError::Validation(format!("key '{key}' does not exist")));
        }

        let estimator = MemoryUsageEstimator::default();
        let size = estimator
            .estimate(keyspace, key, &key_type)
            .await?
            .unwrap_or(0);
        let ttl = keyspace.ttl(key).await?;
        let element_count = keyspace.element_count(key, &key_type).await?;
        let encoding = keyspace.encoding(key).await;
        let preview = keyspace.preview(key, &key_type).await?;
        let preview_truncated = if key_type == "string" {
            element_count > PREVIEW_BYTES as u64
        } else {
            element_count > PREVIEW_ELEMENTS as u64
        };

        Ok(KeyDetails {
            key: key.to_string(),
            size_bytes: size,
            size_formatted: format_bytes(size),
            size_source: estimator.source().to_string(),
            is_large: size >= self.settings.large_key_threshold,
            ttl_seconds: (ttl >= 0).then_some(ttl),
            encoding,
            element_count,
            preview,
            preview_truncated,
            key_type,
        })
    }
}
