use crate::code::{RcCode, TuningWord};
use crate::Result;
use serde::{Deserialize, Serialize};

/// Free-running counter snapshot. All three wrap at 2^32.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// RC 2MHz reference edges.
    pub reference: u32,
    /// Divided LC tank edges, only counting while RX or TX is enabled.
    pub lc: u32,
    pub adc: u32,
}

/// The radio, scan chain and timer of one mote.
///
/// Interrupt handlers belong to the implementation; they report into the
/// [`Irq`](crate::Irq) shared with the engine and must do nothing else.
pub trait Mote {
    fn enable_rx(&mut self);
    fn enable_tx(&mut self);
    fn rf_off(&mut self);
    /// Start listening; the radio goes idle again after one frame.
    fn receive_now(&mut self);
    /// Send the loaded packet. Completion arrives as `on_tx_end`.
    fn transmit_now(&mut self);
    fn load_packet(&mut self, payload: &[u8]);
    /// Program the LC tank through the scan chain.
    fn set_tuning(&mut self, word: TuningWord);
    fn read_tick_counters(&mut self) -> Counters;
    /// One-shot compare against `now_ticks`. Fires immediately if already passed.
    fn arm_timeout(&mut self, deadline: u32);
    fn cancel_timeout(&mut self);
    fn now_ticks(&self) -> u32;
    fn rc_code(&self) -> RcCode;
    fn set_rc_code(&mut self, code: RcCode);
    /// Copy out the last received payload (CRC stripped), returns its length.
    fn read_frame(&mut self, buf: &mut [u8]) -> usize;
    /// Demodulator IF estimate for the last received frame. 0 means none.
    fn if_estimate(&self) -> u16;
    fn program_image(&self) -> &[u8];
    fn program_crc(&self) -> u32;
    /// Sleep until at least one interrupt has been handled.
    fn wait_for_interrupt(&mut self) -> Result<()>;
}
