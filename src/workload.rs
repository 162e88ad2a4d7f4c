use std::collections::{BTreeMap, BTreeSet};
use std::io::BufRead;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use tracing::trace;

use crate::configuration::{BenchDescription, WorkloadMode, WorkloadSourceKind};
use crate::distribution::{Distribution, DistributionContext, DistributionSpec};
use crate::generator::{build_key_name, KeySpace, PrintableValueGenerator, ValueGenerator};
use crate::trace::{TraceLine, TraceOperation, TraceSource};

/// Latency samples are grouped by the number of keys in the request.
pub type CategoryKey = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

/// A single operation ready to be dispatched.
#[derive(Clone, Debug)]
pub struct Request {
    kind: RequestKind,
    keys: BTreeSet<String>,
    // Keys drawn before duplicates collapse into `keys`.
    batch_size: usize,
    fields: Arc<BTreeSet<String>>,
    values: BTreeMap<String, Bytes>,
}

impl Request {
    pub fn read(keys: BTreeSet<String>, batch_size: usize, fields: Arc<BTreeSet<String>>) -> Self {
        Self {
            kind: RequestKind::Read,
            keys,
            batch_size,
            fields,
            values: BTreeMap::new(),
        }
    }

    pub fn write(
        key: String,
        fields: Arc<BTreeSet<String>>,
        values: BTreeMap<String, Bytes>,
    ) -> Self {
        let mut keys = BTreeSet::new();
        keys.insert(key);
        Self {
            kind: RequestKind::Write,
            keys,
            batch_size: 1,
            fields,
            values,
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn keys(&self) -> &BTreeSet<String> {
        &self.keys
    }

    pub fn fields(&self) -> &BTreeSet<String> {
        &self.fields
    }

    pub fn values(&self) -> &BTreeMap<String, Bytes> {
        &self.values
    }

    /// The batch size as drawn, or `None` for a request without keys.
    pub fn category(&self) -> Option<CategoryKey> {
        match self.batch_size {
            0 => None,
            n => Some(n as CategoryKey),
        }
    }
}

pub trait Workload: Send {
    /// Produces the next request, or `None` when the workload is exhausted.
    fn next_request(&mut self) -> Result<Option<Request>>;
}

/// Multi-key reads with batch size and key skew drawn from distributions.
pub struct SyntheticReadWorkload {
    batch_size: Arc<dyn Distribution>,
    skew: Arc<dyn Distribution>,
    key_space: KeySpace,
    fields: Arc<BTreeSet<String>>,

    batch_ctx: DistributionContext,
    skew_ctx: DistributionContext,
}

impl SyntheticReadWorkload {
    pub fn new(
        batch_size: Arc<dyn Distribution>,
        skew: Arc<dyn Distribution>,
        key_space: KeySpace,
        fields: Arc<BTreeSet<String>>,
        seed: u64,
    ) -> Self {
        Self {
            batch_size,
            skew,
            key_space,
            fields,
            batch_ctx: DistributionContext::seeded(seed),
            skew_ctx: DistributionContext::seeded(seed.wrapping_add(1)),
        }
    }
}

impl Workload for SyntheticReadWorkload {
    fn next_request(&mut self) -> Result<Option<Request>> {
        let batch_size = self.batch_size.get_i64(&mut self.batch_ctx).max(1) as usize;
        let keys = (0..batch_size)
            .map(|_| self.key_space.derive(self.skew.get_i64(&mut self.skew_ctx)))
            .collect();
        Ok(Some(Request::read(keys, batch_size, self.fields.clone())))
    }
}

/// Multi-key reads replayed from a trace file.
pub struct TraceReadWorkload<R> {
    trace: TraceSource<R>,
    key_space: KeySpace,
    fields: Arc<BTreeSet<String>>,
}

impl<R: BufRead> TraceReadWorkload<R> {
    pub fn new(trace: TraceSource<R>, key_space: KeySpace, fields: Arc<BTreeSet<String>>) -> Self {
        Self {
            trace,
            key_space,
            fields,
        }
    }
}

impl<R: BufRead + Send> Workload for TraceReadWorkload<R> {
    fn next_request(&mut self) -> Result<Option<Request>> {
        let line = match self.trace.next_line()? {
            Some(line) => line,
            None => return Ok(None),
        };

        // Only reads can be replayed; the arrival modifier is not honored.
        let TraceLine {
            operation: TraceOperation::Read,
            key_tokens,
            modifier,
        } = line;
        trace!(keys = key_tokens.len(), %modifier, "Replaying trace record");

        let mut keys = BTreeSet::new();
        for token in &key_tokens {
            let raw: i64 = token.parse().with_context(|| {
                format!("Invalid key token {:?} in trace {}", token, self.trace.name())
            })?;
            keys.insert(self.key_space.derive(raw));
        }
        Ok(Some(Request::read(keys, key_tokens.len(), self.fields.clone())))
    }
}

/// Populates `user0..user<rows>` in order, one row per request.
pub struct WriteWorkload {
    rows: u64,
    row_cursor: Arc<dyn Distribution>,
    values: Arc<dyn ValueGenerator>,
    fields: Arc<BTreeSet<String>>,

    row_ctx: DistributionContext,
    value_ctx: DistributionContext,
}

impl WriteWorkload {
    pub fn new(
        rows: u64,
        values: Arc<dyn ValueGenerator>,
        fields: Arc<BTreeSet<String>>,
        seed: u64,
    ) -> Result<Self> {
        anyhow::ensure!(rows > 0, "Write workload needs at least one row");
        let row_cursor = DistributionSpec::Sequential(0..=(rows as i64 - 1)).build()?;
        Ok(Self {
            rows,
            row_cursor,
            values,
            fields,
            row_ctx: DistributionContext::seeded(seed),
            value_ctx: DistributionContext::seeded(seed.wrapping_add(2)),
        })
    }
}

impl Workload for WriteWorkload {
    fn next_request(&mut self) -> Result<Option<Request>> {
        if self.row_ctx.get_seq() >= self.rows {
            return Ok(None);
        }
        let row = self.row_cursor.get_i64(&mut self.row_ctx) as u64;
        self.row_ctx.advance();

        let generator = &self.values;
        let value_ctx = &mut self.value_ctx;
        let values = self
            .fields
            .iter()
            .map(|field| (field.clone(), generator.generate(value_ctx)))
            .collect();
        Ok(Some(Request::write(
            build_key_name(row),
            self.fields.clone(),
            values,
        )))
    }
}

/// Builds the workload described by the run configuration.
pub fn from_description(desc: &BenchDescription) -> Result<Box<dyn Workload>> {
    let fields: Arc<BTreeSet<String>> = Arc::new(desc.field_names().into_iter().collect());
    let key_space = KeySpace::new(desc.rows);

    match (desc.mode, &desc.source) {
        (WorkloadMode::Write, _) => {
            let value_size = desc.value_size.build()?;
            let values = Arc::new(PrintableValueGenerator::new(value_size));
            Ok(Box::new(WriteWorkload::new(
                desc.rows, values, fields, desc.seed,
            )?))
        }
        (WorkloadMode::Read, WorkloadSourceKind::Synthetic) => {
            Ok(Box::new(SyntheticReadWorkload::new(
                desc.batch_size.build()?,
                desc.skew.build()?,
                key_space,
                fields,
                desc.seed,
            )))
        }
        (WorkloadMode::Read, WorkloadSourceKind::Trace(path)) => {
            let trace = TraceSource::open(path)?;
            Ok(Box::new(TraceReadWorkload::new(trace, key_space, fields)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::FixedDistribution;
    use std::io::Cursor;

    fn fields() -> Arc<BTreeSet<String>> {
        Arc::new(vec!["field0".to_owned()].into_iter().collect())
    }

    #[test]
    fn synthetic_reads_use_batch_size_and_key_space() {
        let batch = DistributionSpec::Constant(5).build().unwrap();
        let skew = DistributionSpec::Uniform(0..=1_000_000).build().unwrap();
        let mut workload =
            SyntheticReadWorkload::new(batch, skew, KeySpace::new(1_000_000), fields(), 7);
        for _ in 0..100 {
            let req = workload.next_request().unwrap().unwrap();
            assert_eq!(req.kind(), RequestKind::Read);
            assert_eq!(req.category(), Some(5));
            assert!(!req.keys().is_empty() && req.keys().len() <= 5);
            assert!(req.values().is_empty());
            assert!(req.fields().contains("field0"));
        }
    }

    #[test]
    fn synthetic_batch_size_is_clamped_to_one() {
        let batch = Arc::new(FixedDistribution(-3));
        let skew = DistributionSpec::Uniform(1..=100).build().unwrap();
        let mut workload = SyntheticReadWorkload::new(batch, skew, KeySpace::new(100), fields(), 7);
        let req = workload.next_request().unwrap().unwrap();
        assert_eq!(req.category(), Some(1));
    }

    #[test]
    fn trace_reads_map_tokens_through_key_space() {
        let space = KeySpace::new(100_000);
        let trace = TraceSource::from_reader(Cursor::new(b"R 3 7 12 99\n".to_vec()), "test");
        let mut workload = TraceReadWorkload::new(trace, space, fields());

        let req = workload.next_request().unwrap().unwrap();
        assert_eq!(req.category(), Some(3));
        let expected: BTreeSet<String> = [3, 7, 12].iter().map(|&k| space.derive(k)).collect();
        assert_eq!(req.keys(), &expected);

        assert!(workload.next_request().unwrap().is_none());
    }

    #[test]
    fn colliding_keys_keep_the_drawn_batch_size() {
        let batch = DistributionSpec::Constant(5).build().unwrap();
        let skew = DistributionSpec::Uniform(1..=3).build().unwrap();
        let mut workload = SyntheticReadWorkload::new(batch, skew, KeySpace::new(2), fields(), 7);
        for _ in 0..50 {
            let req = workload.next_request().unwrap().unwrap();
            assert!(req.keys().len() <= 2);
            assert_eq!(req.category(), Some(5));
        }
    }

    #[test]
    fn trace_batch_size_counts_tokens_in_small_key_space() {
        let space = KeySpace::new(10);
        let trace = TraceSource::from_reader(Cursor::new(b"R 3 7 12 99\n".to_vec()), "test");
        let mut workload = TraceReadWorkload::new(trace, space, fields());

        let req = workload.next_request().unwrap().unwrap();
        assert_eq!(req.category(), Some(3));
        assert!(req.keys().len() <= 3);
    }

    #[test]
    fn trace_rejects_non_numeric_keys() {
        let trace = TraceSource::from_reader(Cursor::new(b"R 3 abc 0\n".to_vec()), "test");
        let mut workload = TraceReadWorkload::new(trace, KeySpace::new(10), fields());
        assert!(workload.next_request().is_err());
    }

    #[test]
    fn trace_record_without_keys_has_no_category() {
        let trace = TraceSource::from_reader(Cursor::new(b"R 99\n".to_vec()), "test");
        let mut workload = TraceReadWorkload::new(trace, KeySpace::new(10), fields());
        let req = workload.next_request().unwrap().unwrap();
        assert_eq!(req.category(), None);
    }

    #[test]
    fn writes_cover_each_row_once() {
        let values = Arc::new(PrintableValueGenerator::new(Arc::new(FixedDistribution(16))));
        let mut workload = WriteWorkload::new(3, values, fields(), 1).unwrap();

        let mut keys = Vec::new();
        while let Some(req) = workload.next_request().unwrap() {
            assert_eq!(req.kind(), RequestKind::Write);
            assert_eq!(req.category(), Some(1));
            assert_eq!(req.values()["field0"].len(), 16);
            keys.extend(req.keys().iter().cloned());
        }
        assert_eq!(keys, vec!["user0", "user1", "user2"]);
    }
}
