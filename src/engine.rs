use crate::call::{AnalysisCall, Marshal};
use crate::classifier;
use crate::config::Config;
use crate::error::Result;
use crate::executer::Executer;
use crate::tagmap::{Bitmap, TagMap};
use crate::vcpu::ThreadContext;
use log::info;

/// Handle to an initialized engine: the configuration plus the shared tag
/// map for the monitored process.
///
/// The tag map is not synchronized. Hosts that run analysis calls from
/// several threads must arrange access themselves; racing taint updates then
/// mirror the program's own racing memory accesses.
pub struct Engine<T: TagMap = Bitmap> {
    config: Config,
    tags: T,
}

impl Engine<Bitmap> {
    /// Allocate the tag bitmap for `config.address_space` bytes.
    ///
    /// Fails only if the address space is nonsensical or the bitmap cannot
    /// be allocated.
    pub fn init(config: Config) -> Result<Self> {
        let tags = Bitmap::new(config.address_space)?;
        Ok(Self { config, tags })
    }
}

impl<T: TagMap> Engine<T> {
    /// Use an existing tag map instead of allocating a `Bitmap`
    pub fn with_tagmap(config: Config, tags: T) -> Self {
        Self { config, tags }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tagmap(&self) -> &T {
        &self.tags
    }

    pub fn tagmap_mut(&mut self) -> &mut T {
        &mut self.tags
    }

    /// A fresh context for a newly created thread, with no register taint
    pub fn thread_start(&self) -> ThreadContext {
        ThreadContext::new()
    }

    /// The per-instruction hook: attach propagation rules to `ins`. Call this
    /// once per static instruction, before it first executes.
    pub fn instrument<E: Executer>(&self, exe: &mut E, ins: &E::Ins) {
        classifier::instrument(exe, ins, &self.config)
    }

    /// Run one execution's worth of calls attached to an instruction, the
    /// way a host is expected to: predicated calls only when
    /// `args.condition()` holds, and each `Then` only if the preceding `If`
    /// returned true.
    pub fn run<M: Marshal + ?Sized>(&mut self, ctx: &mut ThreadContext, calls: &[AnalysisCall], args: &M) {
        let mut guard = true;
        for call in calls {
            let active = !call.mode.is_predicated() || args.condition();
            if call.mode.is_if() {
                guard = active && call.op.apply(ctx, &mut self.tags, args);
            } else if call.mode.is_then() {
                if active && guard {
                    call.op.apply(ctx, &mut self.tags, args);
                }
            } else if active {
                call.op.apply(ctx, &mut self.tags, args);
            }
        }
    }

    /// Release the tag map. The monitored program is not affected.
    pub fn teardown(self) {
        info!("Tearing down taint engine");
        drop(self.tags);
    }
}
