//! GDT and per-core TSS
//!
//! Selector layout is part of the syscall ABI and of SYSRET's fixed
//! offsets (SS = STAR[63:48]+8, CS = STAR[63:48]+16):
//! - 0x00: null descriptor
//! - 0x08: kernel code (ring 0)
//! - 0x10: kernel data (ring 0)
//! - 0x18: user data (ring 3, selector 0x1B with RPL)
//! - 0x20: user code (ring 3, selector 0x23 with RPL)
//! - 0x28…: one TSS per core (two entries each)

use lazy_static::lazy_static;
use x86_64::{
    instructions::tables::load_tss,
    registers::segmentation::{Segment, CS, DS, ES, SS},
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

use crate::sched::percpu::MAX_CORES;

/// Kernel code selector (ring 0).
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
/// Kernel data selector (ring 0).
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
/// User data selector with RPL 3.
pub const USER_DATA_SELECTOR: u16 = 0x18 | 3;
/// User code selector with RPL 3.
pub const USER_CODE_SELECTOR: u16 = 0x20 | 3;

/// IST slot used by the double-fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const IST_STACK_SIZE: usize = 4096 * 5;
const RING0_STACK_SIZE: usize = 4096 * 5;

#[repr(C, align(16))]
struct AlignedStack<const N: usize>([u8; N]);

static mut IST_STACKS: [AlignedStack<IST_STACK_SIZE>; MAX_CORES] =
    [const { AlignedStack([0; IST_STACK_SIZE]) }; MAX_CORES];

static mut RING0_STACKS: [AlignedStack<RING0_STACK_SIZE>; MAX_CORES] =
    [const { AlignedStack([0; RING0_STACK_SIZE]) }; MAX_CORES];

lazy_static! {
    static ref TSS: [TaskStateSegment; MAX_CORES] = {
        let mut all = [const { TaskStateSegment::new() }; MAX_CORES];
        for (core_id, tss) in all.iter_mut().enumerate() {
            // Ring 3 -> ring 0 transitions land on this stack.
            tss.privilege_stack_table[0] = {
                // SAFETY: each core takes exactly its own stack slot.
                let top = unsafe { core::ptr::addr_of_mut!(RING0_STACKS[core_id]).add(1) };
                VirtAddr::from_ptr(top)
            };
            tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
                // SAFETY: as above.
                let top = unsafe { core::ptr::addr_of_mut!(IST_STACKS[core_id]).add(1) };
                VirtAddr::from_ptr(top)
            };
        }
        all
    };
    static ref GDT: (GlobalDescriptorTable<32>, [SegmentSelector; MAX_CORES]) = {
        let mut gdt = GlobalDescriptorTable::empty();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        let user_data = gdt.append(Descriptor::user_data_segment());
        let user_code = gdt.append(Descriptor::user_code_segment());
        assert_eq!(kernel_code.0, KERNEL_CODE_SELECTOR);
        assert_eq!(kernel_data.0, KERNEL_DATA_SELECTOR);
        assert_eq!(user_data.0 | 3, USER_DATA_SELECTOR as u16);
        assert_eq!(user_code.0 | 3, USER_CODE_SELECTOR as u16);

        let mut tss_selectors = [SegmentSelector(0); MAX_CORES];
        for (core_id, selector) in tss_selectors.iter_mut().enumerate() {
            *selector = gdt.append(Descriptor::tss_segment(&TSS[core_id]));
        }
        (gdt, tss_selectors)
    };
}

/// Load the shared GDT and this core's TSS, and reload the segment
/// registers to the kernel selectors.
pub fn init(core_id: usize) {
    GDT.0.load();
    // SAFETY: the selectors reference descriptors in the GDT just loaded;
    // the TSS entry belongs to this core alone.
    unsafe {
        CS::set_reg(SegmentSelector(KERNEL_CODE_SELECTOR));
        SS::set_reg(SegmentSelector(KERNEL_DATA_SELECTOR));
        DS::set_reg(SegmentSelector(0));
        ES::set_reg(SegmentSelector(0));
        load_tss(GDT.1[core_id]);
    }
}
