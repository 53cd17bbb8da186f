//! API tests

use nos_api::error::{io_error, ErrorContext};
use nos_api::*;

#[test]
fn test_page_helpers() {
    assert_eq!(page_round_down(PAGE_SIZE * 3 + 1), PAGE_SIZE * 3);
    assert_eq!(page_round_up(PAGE_SIZE * 3 + 1), PAGE_SIZE * 4);
    assert_eq!(page_round_up(PAGE_SIZE), PAGE_SIZE);
}

#[test]
fn test_virt_addr_arithmetic() {
    let va = VirtAddr::new(0x4000);
    assert_eq!(va.add_pages(2), VirtAddr::new(0x6000));
    assert_eq!(va.saturating_sub(0x5000), VirtAddr::new(0));
    assert_eq!(va.checked_add(0x10), Some(VirtAddr::new(0x4010)));
    assert_eq!(format!("{}", va), "0x4000");
}

#[test]
fn test_swap_slot_index() {
    assert_eq!(SwapSlot(7).index(), 7);
}

#[test]
fn test_error_display() {
    assert_eq!(format!("{}", Error::OutOfMemory), "Out of memory");
    let config = Error::ConfigError("bad stack".into());
    assert_eq!(format!("{}", config), "Configuration error: bad stack");
    let err: Error = KernelError::OutOfSpace.into();
    assert_eq!(format!("{}", err), "Kernel error: Out of space");

    let res: Result<()> = Err(io_error("eof"));
    assert_eq!(res.context("read").unwrap_err(), Error::IoError("read: eof".to_string()));
}
