//! Simulation capture and K12 monitoring.
//!
//! The recorder accumulates one JSON record per event
//! (`{time, meta, len, data}`, data as `aa|bb|…` hex) and writes the whole
//! array at simulation end. The K12 dump is the line format wireshark's
//! text2pcap understands, emitted live when monitoring is on.

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use serde_json::{Value, json};

use crate::mbuf::Mbuf;

fn hex_pipes(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 3);
    for b in data {
        s.push_str(&format!("{:02x}|", b));
    }
    s
}

/// Accumulates capture records during a simulation run.
#[derive(Debug, Default)]
pub struct Recorder {
    records: RefCell<Vec<Value>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_frame(&self, time_sec: f64, meta: &str, m: &Mbuf) {
        self.push(time_sec, meta, m.pkt_len() as usize, m.k12_string());
    }

    pub fn append_bytes(&self, time_sec: f64, meta: &str, data: &[u8]) {
        self.push(time_sec, meta, data.len(), hex_pipes(data));
    }

    fn push(&self, time_sec: f64, meta: &str, len: usize, data: String) {
        self.records.borrow_mut().push(json!({
            "time": time_sec,
            "meta": meta,
            "len": len,
            "data": data,
        }));
    }

    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }

    pub fn records(&self) -> Vec<Value> {
        self.records.borrow().clone()
    }

    /// Write the record array to `path` as pretty JSON.
    pub fn export(&self, path: &Path) -> io::Result<()> {
        let mut f = File::create(path)?;
        serde_json::to_writer_pretty(&mut f, &*self.records.borrow())?;
        f.write_all(b"\n")
    }
}

fn frac(a: f64) -> f64 {
    a - (a as u64) as f64
}

/// Dump one frame in K12 text form.
pub fn k12_dump(w: &mut dyn Write, time_sec: f64, m: &Mbuf) -> io::Result<()> {
    let mins = (time_sec as u64 / 60) % 60;
    let secs = time_sec as u64 % 60;
    let ms = (frac(time_sec) * 1000.0) as u64;
    let us = (frac(time_sec * 1000.0) * 1000.0) as u64;
    writeln!(w)?;
    writeln!(w, "+---------+---------------+----------+")?;
    writeln!(w, "00:{:02}:{:02},{:03},{:03}   ETHER ", mins, secs, ms, us)?;
    writeln!(w, "|0   |{}", m.k12_string())?;
    writeln!(w)
}
