use bitflags::bitflags;

bitflags! {
    /// Processor status register. The mode bit is the LSB; set means kernel
    /// mode. A trap shifts the current pair into the previous pair before
    /// entering kernel mode, and trap return shifts them back.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Psr: u32 {
        const CURRENT_MODE = 1 << 0;
        const CURRENT_INT = 1 << 1;
        const PREV_MODE = 1 << 2;
        const PREV_INT = 1 << 3;
    }
}

impl Psr {
    pub fn is_kernel_mode(self) -> bool {
        self.contains(Psr::CURRENT_MODE)
    }

    pub fn interrupts_enabled(self) -> bool {
        self.contains(Psr::CURRENT_INT)
    }

    /// The PSR a trap installs: current bits saved into the previous pair,
    /// kernel mode and interrupts on.
    pub fn trap_entry(self) -> Psr {
        let mut psr = Psr::CURRENT_MODE | Psr::CURRENT_INT;
        psr.set(Psr::PREV_MODE, self.contains(Psr::CURRENT_MODE));
        psr.set(Psr::PREV_INT, self.contains(Psr::CURRENT_INT));
        psr
    }
}

/// The argument block the simulator hands to the syscall handler. All fields
/// are pointer-sized; the per-syscall packing is a fixed convention shared
/// with the user-mode trampolines.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrapFrame {
    pub number: usize,
    pub arg1: usize,
    pub arg2: usize,
    pub arg3: usize,
    pub arg4: usize,
    pub arg5: usize,
}

impl TrapFrame {
    pub fn new(number: usize) -> TrapFrame {
        TrapFrame {
            number,
            ..TrapFrame::default()
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TrapKind {
    Syscall,
    IllegalInstruction,
}

pub enum Trap<'a> {
    Syscall(&'a mut TrapFrame),
    IllegalInstruction,
}

pub trait ITrapHandler: Send + Sync {
    fn handle(&self, trap: Trap<'_>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_entry_saves_user_state() {
        let user = Psr::CURRENT_INT; // user mode, interrupts on
        let entered = user.trap_entry();
        assert!(entered.is_kernel_mode());
        assert!(entered.interrupts_enabled());
        assert!(!entered.contains(Psr::PREV_MODE));
        assert!(entered.contains(Psr::PREV_INT));
    }

    #[test]
    fn trap_entry_from_kernel_keeps_mode() {
        let kernel = Psr::CURRENT_MODE | Psr::CURRENT_INT;
        let entered = kernel.trap_entry();
        assert!(entered.contains(Psr::PREV_MODE));
        assert!(entered.is_kernel_mode());
    }
}
