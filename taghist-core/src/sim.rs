//! In-memory device simulator.
//!
//! Stands in for a PLC transport in demos and tests: block memory is a byte
//! map that tests and the demo binary mutate directly, and reads can be
//! forced to fail to exercise the scheduler's isolation paths.

use crate::{
    codec,
    device::{ClientFactory, DeviceClient},
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, RwLock,
    },
};
use taghist_error::{THError, THResult};

#[derive(Default)]
struct SimState {
    blocks: RwLock<HashMap<u16, Vec<u8>>>,
    fail_connect: AtomicBool,
    fail_reads: AtomicBool,
    opens: AtomicU64,
    reads: AtomicU64,
}

/// Shared handle to simulated device memory. Cloning shares the state, so a
/// test can mutate memory while a poll cycle reads it.
#[derive(Clone, Default)]
pub struct SimDevice {
    state: Arc<SimState>,
}

impl SimDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write raw bytes into a block, growing it with zeroes as needed.
    pub fn set_bytes(&self, block: u16, offset: usize, bytes: &[u8]) {
        let mut blocks = self.state.blocks.write().unwrap();
        let mem = blocks.entry(block).or_default();
        if mem.len() < offset + bytes.len() {
            mem.resize(offset + bytes.len(), 0);
        }
        mem[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn set_byte(&self, block: u16, offset: usize, value: u8) {
        self.set_bytes(block, offset, &[value]);
    }

    pub fn set_int16(&self, block: u16, offset: usize, value: i16) {
        self.set_bytes(block, offset, &codec::encode_int16(value));
    }

    pub fn set_int32(&self, block: u16, offset: usize, value: i32) {
        self.set_bytes(block, offset, &codec::encode_int32(value));
    }

    pub fn set_bit(&self, block: u16, offset: usize, bit_index: u8, on: bool) {
        let mut byte = {
            let blocks = self.state.blocks.read().unwrap();
            blocks
                .get(&block)
                .and_then(|mem| mem.get(offset).copied())
                .unwrap_or(0)
        };
        codec::set_bit(&mut byte, bit_index, on);
        self.set_byte(block, offset, byte);
    }

    /// Make `open()` fail until cleared.
    pub fn set_fail_connect(&self, on: bool) {
        self.state.fail_connect.store(on, Ordering::SeqCst);
    }

    /// Make every read fail until cleared.
    pub fn set_fail_reads(&self, on: bool) {
        self.state.fail_reads.store(on, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> u64 {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> u64 {
        self.state.reads.load(Ordering::SeqCst)
    }

    /// Client factory handing out clients backed by this device's memory,
    /// regardless of the source key.
    pub fn factory(&self) -> ClientFactory {
        let device = self.clone();
        Arc::new(move |_spec| Box::new(SimClient {
            device: device.clone(),
        }))
    }
}

struct SimClient {
    device: SimDevice,
}

#[async_trait]
impl DeviceClient for SimClient {
    async fn open(&mut self) -> THResult<()> {
        if self.device.state.fail_connect.load(Ordering::SeqCst) {
            return Err(THError::SourceUnreachable("simulated connect failure".into()));
        }
        self.device.state.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&mut self, block: u16, offset: u32, length: u32) -> THResult<Vec<u8>> {
        if self.device.state.fail_reads.load(Ordering::SeqCst) {
            return Err(THError::ReadError("simulated read failure".into()));
        }
        self.device.state.reads.fetch_add(1, Ordering::SeqCst);
        let blocks = self.device.state.blocks.read().unwrap();
        let mem = blocks.get(&block);
        let mut out = vec![0u8; length as usize];
        if let Some(mem) = mem {
            let start = (offset as usize).min(mem.len());
            let end = (offset as usize + length as usize).min(mem.len());
            if start < end {
                out[..end - start].copy_from_slice(&mem[start..end]);
            }
        }
        Ok(out)
    }

    async fn close(&mut self) {}
}
