use mcusim_machine::{spi_base, usart_base, SocConfig, Stm32f405Soc, GPIO_BASE};
use proptest::prelude::*;

fn soc() -> Stm32f405Soc {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Stm32f405Soc::new(SocConfig::default()).unwrap()
}

#[test]
fn unmapped_addresses_float_and_drop() {
    let mut soc = soc();
    soc.write_u32(0x4000_7000, 0xDEAD_BEEF);
    assert_eq!(soc.read_u32(0x4000_7000), 0);
    assert_eq!(soc.device_at(0x4000_7000), None);
}

#[test]
fn illegal_widths_never_reach_the_device() {
    let mut soc = soc();
    soc.write(GPIO_BASE + 0x14, 8, u64::MAX);
    soc.write(GPIO_BASE + 0x14, 3, 0xFFFF);
    assert_eq!(soc.read_u32(GPIO_BASE + 0x14), 0);
    assert_eq!(soc.read(GPIO_BASE + 0x14, 8), 0);
}

#[test]
fn reserved_offsets_read_zero_and_keep_neighbours_intact() {
    let mut soc = soc();
    let usart1 = usart_base(0).unwrap();
    soc.write_u32(usart1 + 0x200, 0xFFFF_FFFF);
    assert_eq!(soc.read_u32(usart1 + 0x200), 0);
    assert_eq!(soc.read_u32(usart1), 0xC0);
}

#[test]
fn read_only_status_bits_ignore_writes() {
    let mut soc = soc();
    let spi1 = spi_base(0).unwrap();
    soc.write_u32(spi1 + 0x08, 0);
    assert_eq!(soc.read_u32(spi1 + 0x08), 0x0A);
}

proptest! {
    #[test]
    fn arbitrary_bus_traffic_is_absorbed(
        ops in prop::collection::vec(
            (
                0x4000_0000u64..0x4002_2400,
                any::<u32>(),
                prop::sample::select(vec![1usize, 2, 3, 4, 8]),
                0u64..5_000,
            ),
            0..64,
        ),
    ) {
        let mut soc = Stm32f405Soc::new(SocConfig {
            enable_fifo_spi: true,
            fifo_spi_cs_width: 4,
            ..SocConfig::default()
        })
        .unwrap();
        for (addr, value, size, delay) in ops {
            soc.write(addr, size, u64::from(value));
            let read = soc.read(addr, size);
            if soc.device_at(addr).is_none() || !matches!(size, 1 | 2 | 4) {
                prop_assert_eq!(read, 0);
            }
            soc.advance_ns(delay);
        }
    }
}
