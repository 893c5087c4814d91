use std::cell::RefCell;

use crate::{
    dmac::{
        control_block::{ControlBlock, StrideBits, TransferInfo, TransferLength},
        Cs, CHANNEL_COUNT,
    },
    mmio::RegisterPort,
};

/// Register block base used by [`SimDmac`]; matches `DmaConfig::BCM2835`.
pub(crate) const BASE: u32 = 0x2000_7000;
pub(crate) const ENABLE: u32 = BASE + 0xFF0;

pub(crate) const fn cs(channel: u8) -> u32 {
    BASE + channel as u32 * 0x100
}

pub(crate) const fn conblk_ad(channel: u8) -> u32 {
    cs(channel) + 0x04
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Access {
    Read { addr: u32, value: u32 },
    Write { addr: u32, value: u32 },
}

/// A simulated DMA controller.
///
/// Bus addresses index directly into a simulated memory. Starting a channel
/// executes its control block against that memory immediately; the channel
/// then reports `ACTIVE` for a configurable number of status polls before
/// completing.
pub(crate) struct SimDmac {
    state: RefCell<State>,
}

struct State {
    memory: Vec<u8>,
    /// Control blocks handed out by `bus_address`; block `n` has bus address
    /// `(n + 1) << 8`.
    published: Vec<*const ControlBlock>,
    conblk_ad: [u32; CHANNEL_COUNT as usize],
    cs: [u32; CHANNEL_COUNT as usize],
    latency: [u32; CHANNEL_COUNT as usize],
    remaining: [u32; CHANNEL_COUNT as usize],
    stuck: u32,
    faulty: u32,
    enable: Option<u32>,
    log: Vec<Access>,
    executed: Vec<(u8, ControlBlock)>,
}

impl SimDmac {
    pub(crate) fn new(memory_len: usize) -> Self {
        trace_init();
        Self {
            state: RefCell::new(State {
                memory: vec![0; memory_len],
                published: Vec::new(),
                conblk_ad: [0; CHANNEL_COUNT as usize],
                cs: [0; CHANNEL_COUNT as usize],
                latency: [0; CHANNEL_COUNT as usize],
                remaining: [0; CHANNEL_COUNT as usize],
                stuck: 0,
                faulty: 0,
                enable: None,
                log: Vec::new(),
                executed: Vec::new(),
            }),
        }
    }

    /// `channel` reports `ACTIVE` for `polls` status reads after it starts.
    pub(crate) fn with_latency(self, channel: u8, polls: u32) -> Self {
        self.state.borrow_mut().latency[channel as usize] = polls;
        self
    }

    /// `channel` never completes.
    pub(crate) fn stuck(self, channel: u8) -> Self {
        self.state.borrow_mut().stuck |= 1 << channel;
        self
    }

    /// `channel` raises `ERROR` instead of copying anything.
    pub(crate) fn faulty(self, channel: u8) -> Self {
        self.state.borrow_mut().faulty |= 1 << channel;
        self
    }

    pub(crate) fn load(&self, addr: u32, bytes: &[u8]) {
        let addr = addr as usize;
        self.state.borrow_mut().memory[addr..addr + bytes.len()].copy_from_slice(bytes);
    }

    pub(crate) fn read(&self, addr: u32, len: usize) -> Vec<u8> {
        let addr = addr as usize;
        self.state.borrow().memory[addr..addr + len].to_vec()
    }

    pub(crate) fn log(&self) -> Vec<Access> {
        self.state.borrow().log.clone()
    }

    pub(crate) fn writes(&self) -> Vec<(u32, u32)> {
        self.log()
            .into_iter()
            .filter_map(|access| match access {
                Access::Write { addr, value } => Some((addr, value)),
                Access::Read { .. } => None,
            })
            .collect()
    }

    pub(crate) fn reads_of(&self, addr: u32) -> usize {
        self.log()
            .iter()
            .filter(|access| matches!(access, Access::Read { addr: a, .. } if *a == addr))
            .count()
    }

    pub(crate) fn clear_log(&self) {
        self.state.borrow_mut().log.clear();
    }

    /// Control blocks the simulated channels have executed, in start order.
    pub(crate) fn executed(&self) -> Vec<(u8, ControlBlock)> {
        self.state.borrow().executed.clone()
    }

    pub(crate) fn enabled(&self) -> Option<u32> {
        self.state.borrow().enable
    }
}

impl RegisterPort for SimDmac {
    fn read32(&self, addr: u32) -> u32 {
        let mut state = self.state.borrow_mut();
        let value = match decode(addr) {
            Some((channel, 0x00)) => state.poll(channel),
            Some((channel, 0x04)) => state.conblk_ad[channel as usize],
            _ if addr == ENABLE => state.enable.unwrap_or(0),
            _ => panic!("read from unexpected register {addr:#010x}"),
        };
        state.log.push(Access::Read { addr, value });
        value
    }

    fn write32(&self, addr: u32, value: u32) {
        let mut state = self.state.borrow_mut();
        state.log.push(Access::Write { addr, value });
        match decode(addr) {
            Some((channel, 0x00)) => state.write_cs(channel, Cs::from_bits(value)),
            Some((channel, 0x04)) => state.conblk_ad[channel as usize] = value,
            _ if addr == ENABLE => state.enable = Some(value),
            _ => panic!("write to unexpected register {addr:#010x}"),
        }
    }

    fn bus_address(&self, block: &ControlBlock) -> u32 {
        let ptr = block as *const ControlBlock;
        assert_eq!(
            ptr as usize % 256,
            0,
            "control blocks must be 256-byte aligned"
        );
        let mut state = self.state.borrow_mut();
        state.published.push(ptr);
        (state.published.len() as u32) << 8
    }
}

fn decode(addr: u32) -> Option<(u8, u32)> {
    let offset = addr.checked_sub(BASE)?;
    let channel = offset / 0x100;
    if channel >= u32::from(CHANNEL_COUNT) {
        return None;
    }
    Some((channel as u8, offset % 0x100))
}

impl State {
    fn poll(&mut self, channel: u8) -> u32 {
        let idx = channel as usize;
        if self.stuck & (1 << channel) == 0 && self.remaining[idx] > 0 {
            self.remaining[idx] -= 1;
            if self.remaining[idx] == 0 {
                self.cs[idx] = Cs::new().with(Cs::END, true).bits();
            }
        }
        self.cs[idx]
    }

    fn write_cs(&mut self, channel: u8, value: Cs) {
        let idx = channel as usize;
        if value.get(Cs::RESET) {
            self.cs[idx] = 0;
            self.remaining[idx] = 0;
            return;
        }
        if !value.get(Cs::ACTIVE) {
            return;
        }

        let token = self.conblk_ad[idx] >> 8;
        assert!(token > 0, "channel {channel} started without a control block");
        let block = unsafe {
            // Safety: the driver keeps published blocks alive until the
            // channel completes, and blocks are executed as soon as the
            // channel starts.
            (*self.published[token as usize - 1]).clone()
        };

        if self.faulty & (1 << channel) != 0 {
            self.cs[idx] = Cs::new().with(Cs::ERROR, true).bits();
        } else {
            self.execute(&block);
            let latency = self.latency[idx];
            if latency == 0 && self.stuck & (1 << channel) == 0 {
                self.cs[idx] = Cs::new().with(Cs::END, true).bits();
            } else {
                self.cs[idx] = Cs::new().with(Cs::ACTIVE, true).bits();
                self.remaining[idx] = latency;
            }
        }
        self.executed.push((channel, block));
    }

    fn execute(&mut self, block: &ControlBlock) {
        let ti = block.transfer_info();
        assert!(ti.get(TransferInfo::SRC_INC) && ti.get(TransferInfo::DEST_INC));
        let mut src = block.source_address() as isize;
        let mut dst = block.destination_address() as isize;

        if !block.is_2d() {
            self.copy(src, dst, block.transfer_length() as usize);
            return;
        }

        let len = TransferLength::from_bits(block.transfer_length());
        let row = len.get(TransferLength::XLENGTH) as isize;
        let rows = len.get(TransferLength::YLENGTH);
        let stride = StrideBits::from_bits(block.stride());
        let s_stride = stride.get(StrideBits::S_STRIDE) as u16 as i16 as isize;
        let d_stride = stride.get(StrideBits::D_STRIDE) as u16 as i16 as isize;
        for _ in 0..rows {
            self.copy(src, dst, row as usize);
            src += row + s_stride;
            dst += row + d_stride;
        }
    }

    fn copy(&mut self, src: isize, dst: isize, len: usize) {
        let (src, dst) = (src as usize, dst as usize);
        self.memory.copy_within(src..src + len, dst);
    }
}

pub(crate) fn trace_init() {
    use tracing_subscriber::filter::{EnvFilter, LevelFilter};

    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
    let filter = if env.is_empty() {
        builder.parse_lossy("bcm2835_dma=debug")
    } else {
        builder.parse_lossy(env)
    };

    let _res = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .without_time()
        .try_init();
}
