//! Per-function, per-basic-block runtime value store (spec §3 "Runtime
//! value store", §4.5).
//!
//! Block layout is derived once from the bitcode and shared across all
//! executions of that block; each activation gets its own blob, long-double
//! side array, and "has value" bitset, addressed by the instruction's
//! intra-block index.

/// An arbitrary-precision floating point value, preserving the exact bit
/// pattern of 80-bit (x87 extended) or 128-bit long doubles across platforms
/// that do not natively support the 80-bit form (spec §4.5 correctness
/// note). Stored as the raw little-endian byte pattern rather than decoded,
/// since the tracer never needs to compute on these values, only replay
/// them exactly.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LongDouble {
    Extended80([u8; 10]),
    Quad128([u8; 16]),
}

impl LongDouble {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            LongDouble::Extended80(b) => b,
            LongDouble::Quad128(b) => b,
        }
    }
}

/// Which scalar kind an instruction's recorded value slot holds. Integers
/// up to 64 bits (zero/sign-extended to 64) and pointers share a slot kind
/// since both are stored as a 64-bit word; `float`/`double` get their native
/// width, and long doubles are stored out-of-line in the side array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotKind {
    Int64,
    Float32,
    Float64,
    LongDouble,
}

impl SlotKind {
    fn blob_width(self) -> usize {
        match self {
            SlotKind::Int64 => 8,
            SlotKind::Float32 => 4,
            SlotKind::Float64 => 8,
            SlotKind::LongDouble => 0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct SlotDescriptor {
    kind: SlotKind,
    offset: usize, // byte offset into the blob, or index into long_doubles for LongDouble
}

/// Computed once per basic block and shared by every activation of that
/// block: for each instruction producing a recordable value, where its slot
/// lives.
#[derive(Clone, Debug, Default)]
pub struct BlockLayout {
    slots: Vec<Option<SlotDescriptor>>,
    blob_size: usize,
    long_double_count: usize,
}

impl BlockLayout {
    pub fn builder() -> BlockLayoutBuilder {
        BlockLayoutBuilder::default()
    }

    pub fn instruction_count(&self) -> usize {
        self.slots.len()
    }
}

#[derive(Default)]
pub struct BlockLayoutBuilder {
    slots: Vec<Option<SlotDescriptor>>,
    blob_size: usize,
    long_double_count: usize,
}

impl BlockLayoutBuilder {
    /// Reserves a slot for an instruction that does not produce a
    /// recordable scalar (e.g. a `store`, a terminator).
    pub fn skip(&mut self) -> &mut Self {
        self.slots.push(None);
        self
    }

    pub fn reserve(&mut self, kind: SlotKind) -> &mut Self {
        let descriptor = match kind {
            SlotKind::LongDouble => {
                let offset = self.long_double_count;
                self.long_double_count += 1;
                SlotDescriptor { kind, offset }
            }
            _ => {
                let offset = self.blob_size;
                self.blob_size += kind.blob_width();
                SlotDescriptor { kind, offset }
            }
        };
        self.slots.push(Some(descriptor));
        self
    }

    pub fn build(self) -> BlockLayout {
        BlockLayout {
            slots: self.slots,
            blob_size: self.blob_size,
            long_double_count: self.long_double_count,
        }
    }
}

/// A recorded scalar value, read back out of the store.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RuntimeValue {
    Int(u64),
    Ptr(u64),
    Float(f32),
    Double(f64),
    LongDouble(LongDouble),
}

/// One basic block's worth of recorded values for a single activation. Owns
/// a reference-counted handle to its (shared, immutable) layout rather than
/// borrowing it, so a `TracedFunction` can hold the current block's store
/// without threading a layout lifetime through the whole call stack.
pub struct RuntimeValueStore {
    layout: std::rc::Rc<BlockLayout>,
    blob: Vec<u8>,
    long_doubles: Vec<Option<LongDouble>>,
    has_value: Vec<bool>,
}

impl RuntimeValueStore {
    pub fn new(layout: std::rc::Rc<BlockLayout>) -> Self {
        RuntimeValueStore {
            blob: vec![0u8; layout.blob_size],
            long_doubles: vec![None; layout.long_double_count],
            has_value: vec![false; layout.slots.len()],
            layout,
        }
    }

    fn descriptor(&self, instr_index: usize) -> SlotDescriptor {
        self.layout.slots[instr_index]
            .expect("recording a value for an instruction with no reserved slot")
    }

    pub fn record_int(&mut self, instr_index: usize, value: u64) {
        let d = self.descriptor(instr_index);
        debug_assert_eq!(d.kind, SlotKind::Int64);
        self.blob[d.offset..d.offset + 8].copy_from_slice(&value.to_le_bytes());
        self.has_value[instr_index] = true;
    }

    pub fn record_ptr(&mut self, instr_index: usize, address: u64) {
        self.record_int(instr_index, address);
    }

    pub fn record_float(&mut self, instr_index: usize, value: f32) {
        let d = self.descriptor(instr_index);
        debug_assert_eq!(d.kind, SlotKind::Float32);
        self.blob[d.offset..d.offset + 4].copy_from_slice(&value.to_le_bytes());
        self.has_value[instr_index] = true;
    }

    pub fn record_double(&mut self, instr_index: usize, value: f64) {
        let d = self.descriptor(instr_index);
        debug_assert_eq!(d.kind, SlotKind::Float64);
        self.blob[d.offset..d.offset + 8].copy_from_slice(&value.to_le_bytes());
        self.has_value[instr_index] = true;
    }

    pub fn record_long_double(&mut self, instr_index: usize, value: LongDouble) {
        let d = self.descriptor(instr_index);
        debug_assert_eq!(d.kind, SlotKind::LongDouble);
        self.long_doubles[d.offset] = Some(value);
        self.has_value[instr_index] = true;
    }

    /// Reads back a previously recorded value, or `None` if this
    /// activation has not written that slot yet.
    pub fn get(&self, instr_index: usize) -> Option<RuntimeValue> {
        if !*self.has_value.get(instr_index)? {
            return None;
        }
        let d = self.descriptor(instr_index);
        Some(match d.kind {
            SlotKind::Int64 => {
                let bytes: [u8; 8] = self.blob[d.offset..d.offset + 8].try_into().unwrap();
                RuntimeValue::Int(u64::from_le_bytes(bytes))
            }
            SlotKind::Float32 => {
                let bytes: [u8; 4] = self.blob[d.offset..d.offset + 4].try_into().unwrap();
                RuntimeValue::Float(f32::from_le_bytes(bytes))
            }
            SlotKind::Float64 => {
                let bytes: [u8; 8] = self.blob[d.offset..d.offset + 8].try_into().unwrap();
                RuntimeValue::Double(f64::from_le_bytes(bytes))
            }
            SlotKind::LongDouble => {
                RuntimeValue::LongDouble(self.long_doubles[d.offset].expect("has_value set without a value"))
            }
        })
    }

    pub fn has_value(&self, instr_index: usize) -> bool {
        self.has_value.get(instr_index).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_read_back_mixed_types() {
        let mut b = BlockLayout::builder();
        b.reserve(SlotKind::Int64);
        b.skip();
        b.reserve(SlotKind::Float64);
        let layout = std::rc::Rc::new(b.build());

        let mut store = RuntimeValueStore::new(layout);
        store.record_int(0, 42);
        store.record_double(2, 1.5);

        assert_eq!(store.get(0), Some(RuntimeValue::Int(42)));
        assert_eq!(store.get(1), None);
        assert_eq!(store.get(2), Some(RuntimeValue::Double(1.5)));
    }

    #[test]
    fn long_doubles_use_side_array() {
        let mut b = BlockLayout::builder();
        b.reserve(SlotKind::LongDouble);
        let layout = std::rc::Rc::new(b.build());
        let mut store = RuntimeValueStore::new(layout);
        let ld = LongDouble::Extended80([1; 10]);
        store.record_long_double(0, ld);
        assert_eq!(store.get(0), Some(RuntimeValue::LongDouble(ld)));
    }

    #[test]
    fn fresh_activation_has_no_values() {
        let mut b = BlockLayout::builder();
        b.reserve(SlotKind::Int64);
        let layout = std::rc::Rc::new(b.build());
        let store = RuntimeValueStore::new(layout);
        assert!(!store.has_value(0));
        assert_eq!(store.get(0), None);
    }
}
