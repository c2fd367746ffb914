use crate::executer::Opcode;
use std::collections::HashSet;

#[non_exhaustive]
pub struct Config {
    /// Number of bytes of address space the tag bitmap covers, starting at
    /// address 0. Must be nonzero and at most 4 GiB.
    pub address_space: u64,

    /// What to do with instructions the dispatcher cannot instrument: invalid
    /// opcodes, and operand shapes not covered for an otherwise-supported
    /// instruction.
    pub unhandled: UnhandledHandling,

    /// Opcodes whose default instrumentation is switched off.
    /// Instructions with these opcodes get no analysis calls at all.
    pub disabled: HashSet<Opcode>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address_space: 1 << 32,
            unhandled: UnhandledHandling::Log,
            disabled: HashSet::new(),
        }
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum UnhandledHandling {
    /// Emit a warning and leave the instruction uninstrumented.
    Log,
    /// Leave the instruction uninstrumented without saying anything.
    Ignore,
    /// Panic at instrumentation time. Useful to find coverage gaps while
    /// developing a host; never use this on a production target.
    Panic,
}
