use mcusim::machine::{timer_base, timer_irq};
use mcusim::{SocConfig, Stm32f405Soc};

const CR1: u64 = 0x00;
const DIER: u64 = 0x0C;
const SR: u64 = 0x10;
const CNT: u64 = 0x24;
const PSC: u64 = 0x28;
const ARR: u64 = 0x2C;

const PERIOD_NS: u64 = 1_000_000;

struct Bench {
    soc: Stm32f405Soc,
    base: u64,
    irq: u32,
}

impl Bench {
    /// TIM3 at 1 MHz, PSC=0, ARR=999: one update per millisecond.
    fn new() -> Self {
        let config: SocConfig = serde_json::from_str(r#"{ "timer_clock_hz": 1000000 }"#).unwrap();
        let soc = Stm32f405Soc::new(config).unwrap();
        let mut bench = Self {
            soc,
            base: timer_base(1).unwrap(),
            irq: timer_irq(1).unwrap(),
        };
        bench.wr(PSC, 0);
        bench.wr(ARR, 999);
        bench.wr(DIER, 1);
        bench
    }

    fn wr(&mut self, reg: u64, value: u32) {
        self.soc.write_u32(self.base + reg, value);
    }

    fn rd(&mut self, reg: u64) -> u32 {
        self.soc.read_u32(self.base + reg)
    }

    fn pulses(&self) -> u64 {
        self.soc.nvic().borrow().pulse_count(self.irq)
    }
}

#[test]
fn update_interrupt_every_millisecond() {
    let mut b = Bench::new();
    b.wr(CR1, 1);

    for period in 1..=150u64 {
        b.soc.advance_ns(PERIOD_NS / 2);
        assert_eq!(b.rd(CNT), 500);
        b.soc.advance_ns(PERIOD_NS / 2 - 1_000);
        assert_eq!(b.rd(CNT), 999);
        b.soc.advance_ns(999);
        assert_eq!(b.pulses(), period - 1, "fired early in period {period}");
        b.soc.advance_ns(1);
        assert_eq!(b.pulses(), period, "missed the update of period {period}");
        assert_eq!(b.rd(CNT), 0);
        assert_eq!(b.soc.now_ns(), period * PERIOD_NS);
    }
    assert_eq!(b.rd(SR) & 1, 1);
}

#[test]
fn large_steps_deliver_every_update() {
    let mut b = Bench::new();
    b.wr(CR1, 1);
    assert_eq!(b.soc.advance_ns(100 * PERIOD_NS + 1), 100);
    assert_eq!(b.pulses(), 100);
    assert_eq!(b.soc.next_deadline_ns(), Some(101 * PERIOD_NS));
}

#[test]
fn resume_finishes_the_interrupted_period() {
    let mut b = Bench::new();
    b.wr(CR1, 1);
    b.soc.advance_ns(PERIOD_NS / 2);
    b.wr(CR1, 0);
    assert_eq!(b.soc.next_deadline_ns(), None);

    b.soc.advance_ns(3_333_333);
    assert_eq!(b.rd(CNT), 500);
    assert_eq!(b.pulses(), 0);

    b.wr(CR1, 1);
    let resumed_at = b.soc.now_ns();
    b.soc.advance_ns(PERIOD_NS / 2 - 1);
    assert_eq!(b.pulses(), 0);
    b.soc.advance_ns(1);
    assert_eq!(b.pulses(), 1);
    assert_eq!(b.soc.now_ns() - resumed_at, PERIOD_NS / 2);

    // Then full periods again.
    b.soc.advance_ns(PERIOD_NS);
    assert_eq!(b.pulses(), 2);
}

#[test]
fn status_flag_latches_without_interrupt_enable() {
    let mut b = Bench::new();
    b.wr(DIER, 0);
    b.wr(CR1, 1);
    b.soc.advance_ns(PERIOD_NS);
    assert_eq!(b.pulses(), 0);
    assert_eq!(b.rd(SR) & 1, 1);

    b.wr(SR, 0);
    assert_eq!(b.rd(SR) & 1, 1, "SR is write-one-to-clear");
    b.wr(SR, 1);
    assert_eq!(b.rd(SR) & 1, 0);
}
