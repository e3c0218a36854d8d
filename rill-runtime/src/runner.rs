//! # Host Runner
//!
//! Drives a compiled module across the suspension boundary. The runner parses
//! the `rill.effects` table once, assigns a stable numeric handle to every
//! operation ordinal, and then runs the protocol loop:
//!
//! ```text
//! <name>_effectful(buf, len) ──► effect_status
//!        ▲                          │ 0: decode value, done
//!        │                          │ 1: decode request, find handler,
//!        └── resume_effectful ◄─────┘    write result slot
//! ```
//!
//! ## Handler lookup
//!
//! Handlers are registered under [`HandlerKey`]s. For every request the
//! runner tries the keys returned by [`HandlerKey::candidates`] in order and
//! uses the first registered one:
//!
//! 1. the numeric handle
//! 2. `{effectId:016x}:{opId}:{resumeKind}:{signatureHash:08x}`
//! 3. `{effectId:016x}:{opId}:{resumeKind}`
//! 4. `{effectId:016x}:{opId}`
//! 5. `{effectName}:{opId}:{resumeKind}`
//! 6. `{effectName}:{opId}`
//! 7. the label `{Effect}.{op}`
//!
//! Older registries key handlers by the later forms, so the order is fixed.
//!
//! ## Protocol errors
//!
//! A request with no handler, a request whose effect id or op id disagrees
//! with the table entry at its ordinal or handle, and a request whose resume
//! kind disagrees with the table all abort the run.

use std::fmt;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::config::RunnerConfig;
use crate::machine::{Host, Instance, Trap, Val};
use crate::module::{Import, Module, TrapCode};
use crate::outcome::ResumeKind;
use crate::table::{EffectTable, EffectTableEntry, TableError, EFFECT_TABLE_SECTION};
use crate::wire::{
    encode_args, read_slot, read_slot_expecting, write_raw_slot, write_slot, BufferLayout,
    EffectEnvelope, ValueTag, WireError, WireValue, MAX_WIRE_ARGS, SLOT_SIZE,
};

/// Import module name of the host functions.
pub const HOST_MODULE: &str = "host";

/// Key under which a handler is registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandlerKey {
    Handle(u32),
    Name(String),
}

impl HandlerKey {
    /// Every key that may select a handler for `entry`, most specific first.
    pub fn candidates(entry: &EffectTableEntry, handle: u32) -> Vec<HandlerKey> {
        let eff = entry.effect_id;
        let op = entry.op_id;
        let kind = entry.resume_kind.as_u32();
        let name = &entry.effect_name;
        vec![
            HandlerKey::Handle(handle),
            HandlerKey::Name(format!("{eff:016x}:{op}:{kind}:{:08x}", entry.signature_hash)),
            HandlerKey::Name(format!("{eff:016x}:{op}:{kind}")),
            HandlerKey::Name(format!("{eff:016x}:{op}")),
            HandlerKey::Name(format!("{name}:{op}:{kind}")),
            HandlerKey::Name(format!("{name}:{op}")),
            HandlerKey::Name(entry.label.clone()),
        ]
    }
}

impl From<u32> for HandlerKey {
    fn from(handle: u32) -> Self {
        HandlerKey::Handle(handle)
    }
}

impl From<&str> for HandlerKey {
    fn from(name: &str) -> Self {
        HandlerKey::Name(name.to_string())
    }
}

impl From<String> for HandlerKey {
    fn from(name: String) -> Self {
        HandlerKey::Name(name)
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKey::Handle(h) => write!(f, "#{h}"),
            HandlerKey::Name(n) => f.write_str(n),
        }
    }
}

/// What a handler sees for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerCall {
    pub label: String,
    pub effect_name: String,
    pub effect_id: u64,
    pub op_id: u32,
    pub op_index: u32,
    pub resume_kind: ResumeKind,
    pub signature_hash: u32,
    pub handle: u32,
    pub args: Vec<WireValue>,
}

/// A failure reported by a host handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// Boxed host handler.
pub type HandlerFn = Box<dyn FnMut(&HandlerCall) -> Result<WireValue, HandlerError>>;

/// Handlers keyed by [`HandlerKey`].
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: FxHashMap<HandlerKey, HandlerFn>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, key: impl Into<HandlerKey>, handler: F)
    where
        F: FnMut(&HandlerCall) -> Result<WireValue, HandlerError> + 'static,
    {
        self.handlers.insert(key.into(), Box::new(handler));
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// The first registered key among `keys`.
    pub fn resolve<'k>(&self, keys: &'k [HandlerKey]) -> Option<&'k HandlerKey> {
        keys.iter().find(|k| self.handlers.contains_key(k))
    }

    fn get_mut(&mut self, key: &HandlerKey) -> Option<&mut HandlerFn> {
        self.handlers.get_mut(key)
    }
}

/// Errors that abort a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("no handler registered for `{label}`")]
    MissingHandler { label: String },
    #[error("effect request does not match the table at ordinal {op_index}: {reason}")]
    OpMismatch { op_index: u32, reason: String },
    #[error("resume kind mismatch for `{label}`: table says {expected}, request says {found}")]
    ResumeKindMismatch {
        label: String,
        expected: ResumeKind,
        found: u32,
    },
    #[error("run exceeded {0} resume steps")]
    StepLimit(usize),
    #[error("handler for `{label}` failed: {source}")]
    Handler { label: String, source: HandlerError },
    #[error("unexpected export result: {0}")]
    UnexpectedResult(String),
    #[error(transparent)]
    Trap(#[from] Trap),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Implementation of the `host` imports over the instance's linear memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct WireHost;

impl WireHost {
    fn region<'m>(memory: &'m mut [u8], ptr: &Val, len: &Val) -> Result<&'m mut [u8], Trap> {
        let ptr = ptr.as_i32()? as u32 as usize;
        let len = len.as_i32()? as u32 as usize;
        memory
            .get_mut(ptr..ptr + len)
            .ok_or(Trap::OutOfBounds { addr: ptr, len })
    }
}

fn wire_trap(err: WireError) -> Trap {
    match err {
        WireError::BufferTooSmall { .. } => Trap::Code(TrapCode::BufferOverflow),
        WireError::UnknownTag(_) | WireError::TagMismatch { .. } => Trap::Code(TrapCode::UnsupportedValue),
        WireError::TooManyArgs(_) => Trap::Code(TrapCode::UnsupportedValue),
    }
}

impl Host for WireHost {
    fn call_import(&mut self, import: &Import, args: &[Val], memory: &mut [u8]) -> Result<Option<Val>, Trap> {
        if import.module != HOST_MODULE {
            return Err(Trap::Host(format!("unknown import module `{}`", import.module)));
        }
        match (import.name.as_str(), args) {
            ("write_value", [tag, bits, ptr, len]) => {
                let raw = tag.as_i32()? as u32;
                let tag = ValueTag::from_u32(raw).ok_or(Trap::Code(TrapCode::UnsupportedValue))?;
                let bits = bits.as_i64()? as u64;
                let out = Self::region(memory, ptr, len)?;
                Ok(Some(Val::I32(write_raw_slot(out, tag, bits).is_err() as i32)))
            }
            (
                "write_effect",
                [effect_id, op_id, op_index, kind, handle, args_ptr, arg_count, ptr, len],
            ) => {
                let count = arg_count.as_i32()? as u32 as usize;
                if count > MAX_WIRE_ARGS {
                    return Err(Trap::Code(TrapCode::UnsupportedValue));
                }
                let span = Val::I32((count * SLOT_SIZE) as i32);
                let slots = Self::region(memory, args_ptr, &span)?;
                let args = (0..count)
                    .map(|i| read_slot(&slots[i * SLOT_SIZE..]))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(wire_trap)?;
                let envelope = EffectEnvelope {
                    op_index: op_index.as_i32()? as u32,
                    op_id: op_id.as_i32()? as u32,
                    effect_id: effect_id.as_i64()? as u64,
                    resume_kind: kind.as_i32()? as u32,
                    handle: handle.as_i32()? as u32,
                    args,
                };
                let out = Self::region(memory, ptr, len)?;
                Ok(Some(Val::I32(envelope.encode(out).is_err() as i32)))
            }
            ("read_value", [tag, ptr, len]) => {
                let raw = tag.as_i32()? as u32;
                let tag = ValueTag::from_u32(raw).ok_or(Trap::Code(TrapCode::UnsupportedValue))?;
                let input = Self::region(memory, ptr, len)?;
                let bits = read_slot_expecting(input, tag).map_err(wire_trap)?;
                Ok(Some(Val::I64(bits as i64)))
            }
            (name, args) => Err(Trap::Host(format!(
                "unsupported host import `{name}` with {} arguments",
                args.len()
            ))),
        }
    }
}

/// Drives one instance of a compiled module.
pub struct HostRunner {
    instance: Instance,
    table: EffectTable,
    layout: BufferLayout,
    handles: Vec<u32>,
    registry: HandlerRegistry,
    config: RunnerConfig,
}

impl HostRunner {
    /// Instantiate `module`, parse its effect table and assign handles.
    pub fn new(module: Module, config: RunnerConfig) -> Result<Self, RunError> {
        let table = match module.custom_section(EFFECT_TABLE_SECTION) {
            Some(bytes) => EffectTable::decode(bytes)?,
            None => EffectTable::new(),
        };
        let layout = BufferLayout::from_memory_size(table.len(), module.memory_size);
        let mut instance = Instance::new(Rc::new(module), config.max_call_depth);

        let mut handles = Vec::with_capacity(table.len());
        if !table.is_empty() {
            let count = instance.invoke("init_effects", &[], &mut WireHost)?;
            if count != Some(Val::I32(table.len() as i32)) {
                return Err(RunError::UnexpectedResult(format!(
                    "init_effects reported {count:?}, table has {} entries",
                    table.len()
                )));
            }
            let memory = instance.memory_mut();
            for ordinal in 0..table.len() {
                let handle = ordinal as u32 + 1;
                let at = layout.handle_slot(ordinal);
                memory[at..at + 4].copy_from_slice(&handle.to_le_bytes());
                handles.push(handle);
            }
        }
        info!(ops = table.len(), buffer = layout.buffer_len, "host runner ready");

        Ok(Self {
            instance,
            table,
            layout,
            handles,
            registry: HandlerRegistry::new(),
            config,
        })
    }

    pub fn table(&self) -> &EffectTable {
        &self.table
    }

    pub fn layout(&self) -> BufferLayout {
        self.layout
    }

    /// Handle assigned to an operation ordinal.
    pub fn handle_of(&self, ordinal: usize) -> Option<u32> {
        self.handles.get(ordinal).copied()
    }

    pub fn registry_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.registry
    }

    /// Register a handler under any key form.
    pub fn register<F>(&mut self, key: impl Into<HandlerKey>, handler: F)
    where
        F: FnMut(&HandlerCall) -> Result<WireValue, HandlerError> + 'static,
    {
        self.registry.register(key, handler);
    }

    /// Call `<function>_effectful` with `args` and drive it to a value.
    pub fn run(&mut self, function: &str, args: &[WireValue]) -> Result<WireValue, RunError> {
        let (buf, len) = (self.layout.buffer_offset, self.layout.buffer_len);
        encode_args(&mut self.instance.memory_mut()[buf..buf + len], args)?;
        let export = format!("{function}_effectful");
        info!(export = %export, args = args.len(), "run");

        let ptr_args = [Val::I32(buf as i32), Val::I32(len as i32)];
        let mut outcome = Self::expect_ref(self.instance.invoke(&export, &ptr_args, &mut WireHost)?)?;
        let mut steps = 0usize;
        loop {
            let status = self
                .instance
                .invoke("effect_status", &[outcome.clone()], &mut WireHost)?;
            match status {
                Some(Val::I32(0)) => {
                    let value = read_slot(&self.instance.memory()[buf..buf + len])?;
                    debug!(%value, steps, "run finished");
                    return Ok(value);
                }
                Some(Val::I32(1)) => {}
                other => return Err(RunError::UnexpectedResult(format!("effect_status returned {other:?}"))),
            }

            steps += 1;
            if self.config.max_steps != 0 && steps > self.config.max_steps {
                return Err(RunError::StepLimit(self.config.max_steps));
            }

            let envelope = EffectEnvelope::decode(&self.instance.memory()[buf..buf + len])?;
            let call = self.validate(&envelope)?;
            let result = self.dispatch(&call)?;
            trace!(label = %call.label, %result, "resuming");

            write_slot(&mut self.instance.memory_mut()[buf..buf + len], result)?;
            let cont = self.instance.invoke("effect_cont", &[outcome], &mut WireHost)?;
            let cont = Self::expect_ref(cont)?;
            let resumed = self.instance.invoke(
                "resume_effectful",
                &[cont, Val::I32(buf as i32), Val::I32(len as i32)],
                &mut WireHost,
            )?;
            outcome = Self::expect_ref(resumed)?;
        }
    }

    fn expect_ref(value: Option<Val>) -> Result<Val, RunError> {
        match value {
            Some(v @ Val::Ref(Some(_))) => Ok(v),
            other => Err(RunError::UnexpectedResult(format!("expected an outcome, found {other:?}"))),
        }
    }

    fn validate(&self, envelope: &EffectEnvelope) -> Result<HandlerCall, RunError> {
        let op_index = envelope.op_index;
        let mismatch = |reason: String| RunError::OpMismatch { op_index, reason };
        let entry = self
            .table
            .get(op_index as usize)
            .ok_or_else(|| mismatch("ordinal outside the table".into()))?;
        if entry.effect_id != envelope.effect_id || entry.op_id != envelope.op_id {
            return Err(mismatch(format!(
                "request is {:016x}:{}, table has {:016x}:{}",
                envelope.effect_id, envelope.op_id, entry.effect_id, entry.op_id
            )));
        }
        if self.handle_of(op_index as usize) != Some(envelope.handle) {
            return Err(mismatch(format!("handle {} was not assigned to this ordinal", envelope.handle)));
        }
        if ResumeKind::from_u32(envelope.resume_kind) != Some(entry.resume_kind) {
            return Err(RunError::ResumeKindMismatch {
                label: entry.label.clone(),
                expected: entry.resume_kind,
                found: envelope.resume_kind,
            });
        }
        Ok(HandlerCall {
            label: entry.label.clone(),
            effect_name: entry.effect_name.clone(),
            effect_id: entry.effect_id,
            op_id: entry.op_id,
            op_index,
            resume_kind: entry.resume_kind,
            signature_hash: entry.signature_hash,
            handle: envelope.handle,
            args: envelope.args.clone(),
        })
    }

    fn dispatch(&mut self, call: &HandlerCall) -> Result<WireValue, RunError> {
        let entry = self
            .table
            .get(call.op_index as usize)
            .ok_or_else(|| RunError::MissingHandler { label: call.label.clone() })?;
        let keys = HandlerKey::candidates(entry, call.handle);
        let key = self
            .registry
            .resolve(&keys)
            .cloned()
            .ok_or_else(|| RunError::MissingHandler { label: call.label.clone() })?;
        debug!(label = %call.label, key = %key, args = call.args.len(), "dispatching effect");
        let handler = self
            .registry
            .get_mut(&key)
            .ok_or_else(|| RunError::MissingHandler { label: call.label.clone() })?;
        handler(call).map_err(|source| RunError::Handler {
            label: call.label.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{effect_id_hash, signature_hash};

    fn entry() -> EffectTableEntry {
        EffectTableEntry {
            effect_id: effect_id_hash("Async"),
            effect_name: "Async".into(),
            op_id: 0,
            resume_kind: ResumeKind::Resume,
            signature_hash: signature_hash("Async.await(i32)->i32"),
            label: "Async.await".into(),
        }
    }

    #[test]
    fn test_candidate_key_order() {
        let e = entry();
        let keys = HandlerKey::candidates(&e, 7);
        let eff = format!("{:016x}", e.effect_id);
        let sig = format!("{:08x}", e.signature_hash);
        assert_eq!(
            keys,
            vec![
                HandlerKey::Handle(7),
                HandlerKey::Name(format!("{eff}:0:0:{sig}")),
                HandlerKey::Name(format!("{eff}:0:0")),
                HandlerKey::Name(format!("{eff}:0")),
                HandlerKey::Name("Async:0:0".into()),
                HandlerKey::Name("Async:0".into()),
                HandlerKey::Name("Async.await".into()),
            ]
        );
    }

    #[test]
    fn test_registry_prefers_earlier_keys() {
        let e = entry();
        let keys = HandlerKey::candidates(&e, 1);
        let mut registry = HandlerRegistry::new();
        registry.register("Async.await", |_| Ok(WireValue::I32(1)));
        assert_eq!(registry.resolve(&keys), Some(&HandlerKey::Name("Async.await".into())));
        registry.register("Async:0", |_| Ok(WireValue::I32(2)));
        assert_eq!(registry.resolve(&keys), Some(&HandlerKey::Name("Async:0".into())));
        registry.register(1u32, |_| Ok(WireValue::I32(3)));
        assert_eq!(registry.resolve(&keys), Some(&HandlerKey::Handle(1)));
        assert_eq!(registry.len(), 3);
    }

    fn import(name: &str) -> Import {
        Import {
            module: HOST_MODULE.into(),
            name: name.into(),
            params: vec![],
            result: None,
        }
    }

    #[test]
    fn test_host_write_and_read_value() {
        let mut memory = vec![0u8; 64];
        let mut host = WireHost;
        let written = host
            .call_import(
                &import("write_value"),
                &[Val::I32(1), Val::I64(9), Val::I32(16), Val::I32(16)],
                &mut memory,
            )
            .unwrap();
        assert_eq!(written, Some(Val::I32(0)));
        assert_eq!(read_slot(&memory[16..]).unwrap(), WireValue::I32(9));

        let overflow = host
            .call_import(
                &import("write_value"),
                &[Val::I32(1), Val::I64(9), Val::I32(16), Val::I32(8)],
                &mut memory,
            )
            .unwrap();
        assert_eq!(overflow, Some(Val::I32(1)));

        let bits = host
            .call_import(&import("read_value"), &[Val::I32(1), Val::I32(16), Val::I32(16)], &mut memory)
            .unwrap();
        assert_eq!(bits, Some(Val::I64(9)));
        let wrong = host.call_import(&import("read_value"), &[Val::I32(2), Val::I32(16), Val::I32(16)], &mut memory);
        assert_eq!(wrong, Err(Trap::Code(TrapCode::UnsupportedValue)));
    }

    #[test]
    fn test_host_write_effect_copies_scratch_slots() {
        let mut memory = vec![0u8; 256];
        write_slot(&mut memory[192..], WireValue::I32(4)).unwrap();
        let mut host = WireHost;
        let args = [
            Val::I64(effect_id_hash("Async") as i64),
            Val::I32(0),
            Val::I32(0),
            Val::I32(0),
            Val::I32(1),
            Val::I32(192),
            Val::I32(1),
            Val::I32(0),
            Val::I32(128),
        ];
        let status = host.call_import(&import("write_effect"), &args, &mut memory).unwrap();
        assert_eq!(status, Some(Val::I32(0)));
        let envelope = EffectEnvelope::decode(&memory[..128]).unwrap();
        assert_eq!(envelope.handle, 1);
        assert_eq!(envelope.effect_id, effect_id_hash("Async"));
        assert_eq!(envelope.args, vec![WireValue::I32(4)]);
    }

    #[test]
    fn test_runner_without_effects() {
        let runner = HostRunner::new(Module::new(), RunnerConfig::default()).unwrap();
        assert!(runner.table().is_empty());
        assert_eq!(runner.handle_of(0), None);
    }
}
