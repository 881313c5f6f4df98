//! Typed counters with JSON metadata export.
//!
//! Every component owns a plain stats struct whose fields are shared
//! [`Counter`] handles; the same handles are registered into a [`CounterDb`]
//! so the RPC layer can export values and metadata without reaching into the
//! owning component. The worker is single threaded, so handles are
//! `Rc<Cell<T>>` and reads never need a lock.

use std::cell::Cell;
use std::rc::Rc;

use serde::Serialize;
use serde_json::{Map, Value, json};

/// Counter severity, carried in the exported metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// Shared numeric counter handle.
///
/// Cloning shares the underlying cell; the owning stats struct keeps one
/// clone and the counter db another.
#[derive(Debug, Default, Clone)]
pub struct Counter<T: Copy + Default>(Rc<Cell<T>>);

impl<T: Copy + Default> Counter<T> {
    pub fn get(&self) -> T {
        self.0.get()
    }

    pub fn set(&self, v: T) {
        self.0.set(v);
    }
}

macro_rules! counter_arith {
    ($($t:ty),*) => {$(
        impl Counter<$t> {
            pub fn inc(&self) {
                self.add(1 as $t);
            }

            pub fn add(&self, n: $t) {
                self.0.set(self.0.get() + n);
            }
        }
    )*};
}

counter_arith!(u32, u64, f32, f64);

/// Value slot of a counter record, tagged by the numeric kind.
#[derive(Debug, Clone)]
pub enum CounterVal {
    U32(Counter<u32>),
    U64(Counter<u64>),
    F32(Counter<f32>),
    F64(Counter<f64>),
}

impl CounterVal {
    fn is_zero(&self) -> bool {
        match self {
            CounterVal::U32(c) => c.get() == 0,
            CounterVal::U64(c) => c.get() == 0,
            CounterVal::F32(c) => c.get() == 0.0,
            CounterVal::F64(c) => c.get() == 0.0,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            CounterVal::U32(c) => json!(c.get()),
            CounterVal::U64(c) => json!(c.get()),
            CounterVal::F32(c) => json!(c.get()),
            CounterVal::F64(c) => json!(c.get()),
        }
    }
}

impl From<&Counter<u32>> for CounterVal {
    fn from(c: &Counter<u32>) -> Self {
        CounterVal::U32(c.clone())
    }
}

impl From<&Counter<u64>> for CounterVal {
    fn from(c: &Counter<u64>) -> Self {
        CounterVal::U64(c.clone())
    }
}

impl From<&Counter<f32>> for CounterVal {
    fn from(c: &Counter<f32>) -> Self {
        CounterVal::F32(c.clone())
    }
}

impl From<&Counter<f64>> for CounterVal {
    fn from(c: &Counter<f64>) -> Self {
        CounterVal::F64(c.clone())
    }
}

/// One exported counter: value handle plus metadata.
#[derive(Debug, Clone)]
pub struct CounterRec {
    pub name: &'static str,
    pub help: &'static str,
    pub unit: &'static str,
    pub dump_zero: bool,
    pub info: Severity,
    pub val: CounterVal,
}

impl CounterRec {
    /// A record is exported when it is non-zero or explicitly marked
    /// `dump_zero`.
    pub fn is_valid(&self) -> bool {
        self.dump_zero || !self.val.is_zero()
    }

    fn meta_json(&self) -> Value {
        json!({
            "name": self.name,
            "help": self.help,
            "unit": self.unit,
            "zero": self.dump_zero,
            "info": self.info,
        })
    }
}

/// Named set of counter records owned by one component.
#[derive(Debug, Default)]
pub struct CounterDb {
    pub name: String,
    recs: Vec<CounterRec>,
}

impl CounterDb {
    pub fn new(name: impl Into<String>) -> Self {
        CounterDb { name: name.into(), recs: Vec::new() }
    }

    pub fn add(&mut self, rec: CounterRec) {
        self.recs.push(rec);
    }

    pub fn records(&self) -> &[CounterRec] {
        &self.recs
    }

    pub fn get(&self, name: &str) -> Option<&CounterRec> {
        self.recs.iter().find(|r| r.name == name)
    }

    /// Map of name -> value. Zero records are skipped unless `include_zero`
    /// is set or the record asks for it.
    pub fn marshal_values(&self, include_zero: bool) -> Map<String, Value> {
        let mut m = Map::new();
        for rec in &self.recs {
            if include_zero || rec.is_valid() {
                m.insert(rec.name.to_string(), rec.val.to_json());
            }
        }
        m
    }

    /// Metadata description of every record, value-free.
    pub fn marshal_meta(&self) -> Value {
        json!({
            "name": self.name,
            "meta": self.recs.iter().map(|r| r.meta_json()).collect::<Vec<_>>(),
        })
    }
}

/// Collection of shared counter dbs, one entry per component.
#[derive(Debug, Default)]
pub struct CounterDbVec {
    pub name: String,
    dbs: Vec<Rc<CounterDb>>,
}

impl CounterDbVec {
    pub fn new(name: impl Into<String>) -> Self {
        CounterDbVec { name: name.into(), dbs: Vec::new() }
    }

    pub fn add(&mut self, db: Rc<CounterDb>) {
        self.dbs.push(db);
    }

    pub fn dbs(&self) -> &[Rc<CounterDb>] {
        &self.dbs
    }

    pub fn marshal_values(&self, include_zero: bool) -> Map<String, Value> {
        let mut m = Map::new();
        for db in &self.dbs {
            m.insert(db.name.clone(), Value::Object(db.marshal_values(include_zero)));
        }
        m
    }

    pub fn marshal_meta(&self) -> Map<String, Value> {
        let mut m = Map::new();
        for db in &self.dbs {
            m.insert(db.name.clone(), db.marshal_meta());
        }
        m
    }
}

/// Shorthand for building a record around an existing counter handle.
#[macro_export]
macro_rules! counter_rec {
    ($cnt:expr, $name:literal, $help:literal, $unit:literal, $info:expr) => {
        $crate::counters::CounterRec {
            name: $name,
            help: $help,
            unit: $unit,
            dump_zero: false,
            info: $info,
            val: (&$cnt).into(),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_handles_share_state() {
        let c: Counter<u64> = Counter::default();
        let c2 = c.clone();
        c.inc();
        c2.add(4);
        assert_eq!(c.get(), 5);
    }

    #[test]
    fn marshal_skips_zero_records() {
        let tx: Counter<u64> = Counter::default();
        let err: Counter<u32> = Counter::default();
        let mut db = CounterDb::new("veth");
        db.add(counter_rec!(tx, "TxPkts", "transmitted packets", "pkts", Severity::Info));
        db.add(counter_rec!(err, "RxParseErr", "rx parse errors", "pkts", Severity::Error));

        tx.add(3);
        let vals = db.marshal_values(false);
        assert_eq!(vals.get("TxPkts"), Some(&json!(3)));
        assert!(vals.get("RxParseErr").is_none());

        let vals = db.marshal_values(true);
        assert_eq!(vals.get("RxParseErr"), Some(&json!(0)));
    }

    #[test]
    fn marshal_meta_carries_severity() {
        let err: Counter<u32> = Counter::default();
        let mut db = CounterDb::new("x");
        db.add(counter_rec!(err, "Err", "errors", "ops", Severity::Error));
        let meta = db.marshal_meta();
        assert_eq!(meta["meta"][0]["info"], json!("error"));
        assert_eq!(meta["meta"][0]["unit"], json!("ops"));
    }

    #[test]
    fn dbvec_groups_by_db_name() {
        let a: Counter<u64> = Counter::default();
        a.inc();
        let mut db = CounterDb::new("mbuf-128");
        db.add(counter_rec!(a, "mbufAlloc", "allocations", "ops", Severity::Info));
        let mut vec = CounterDbVec::new("mbuf_pool");
        vec.add(Rc::new(db));
        let vals = vec.marshal_values(false);
        assert_eq!(vals["mbuf-128"]["mbufAlloc"], json!(1));
    }
}
