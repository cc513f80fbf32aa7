//! Kernel entry point
//!
//! The loader hands over a [`BootInfo`] pointer in RDI. Initialization
//! is single-threaded with interrupts disabled: descriptor tables,
//! interrupt controller, timer, memory, task table. The first task
//! comes from the loader-provided initial image; after that the
//! scheduler owns the CPU.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use kernel::arch::x86_64::{gdt, idt, pic, pit};
use kernel::boot::BootInfo;
use kernel::task::TaskType;
use kernel::{arch, klog, mm, sched, serial_println, task, trap};

/// Kernel entry point, called by the loader with interrupts disabled.
#[no_mangle]
pub extern "C" fn kernel_main(boot_info_ptr: *const BootInfo) -> ! {
    kernel::serial::early_puts(b"kernel: entry\n");

    let boot_info = unsafe { &*boot_info_ptr };
    if !boot_info.is_valid() {
        kernel::serial::early_puts(b"kernel: FATAL: bad boot info magic\n");
        loop {
            arch::halt();
        }
    }

    klog::init(log::LevelFilter::Info);
    log::info!("Meridian OS kernel starting");

    gdt::init();
    idt::init();
    pic::init();
    pit::init();

    unsafe {
        mm::init(boot_info);
    }

    trap::init_clock();
    task::init();

    match boot_info.initrd() {
        Some(image) => match task::create(image, TaskType::User) {
            Ok(_) => {}
            Err(e) => panic!("failed to load initial task: {}", e),
        },
        None => log::warn!("no initial image provided; idling"),
    }

    log::info!("entering the scheduler");
    sched::schedule()
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("\nKERNEL PANIC: {}", info);
    loop {
        arch::halt();
    }
}
