//! Boxed immutable UTF-8 strings and the string library. Buffers live in
//! atomic heap memory with a trailing NUL so they can be handed to C.
use std::{
    cmp::Ordering,
    ffi::{CStr, c_char},
    io::Write,
    ptr::{self, NonNull},
    slice, str,
};

use crate::{
    DynamicArray, Eval, Heap, HeapObject, Node, NodeFunc, Object, Pointer, RuntimeError, Thread,
    TypeRef, Value, Vector2f, Vector3f, Vector4f,
    format::{self, CArg, g_text, snprintf},
};

#[repr(C)]
pub struct StringObject {
    header: Object,
    data: NonNull<u8>,
    len: usize,
}

unsafe impl HeapObject for StringObject {}

impl StringObject {
    pub fn new(heap: &Heap, ty: TypeRef, text: &str) -> Self {
        let mut string = Self {
            header: Object::new(ty),
            data: NonNull::dangling(),
            len: 0,
        };
        string.set(heap, text);
        string
    }

    /// Replaces the buffer with a copy of `text`.
    pub fn set(&mut self, heap: &Heap, text: &str) {
        self.setn(heap, text, text.len());
    }

    /// Replaces the buffer with the first `n` bytes of `text`, backed off
    /// to a character boundary.
    pub fn setn(&mut self, heap: &Heap, text: &str, n: usize) {
        let mut n = n.min(text.len());
        while !text.is_char_boundary(n) {
            n -= 1;
        }
        // zeroed, so the terminator is already there
        let data = heap.allocate_atomic(n + 1);
        // SAFETY: fresh buffer of n + 1 bytes
        unsafe { ptr::copy_nonoverlapping(text.as_ptr(), data.as_ptr(), n) };
        self.data = data;
        self.len = n;
    }

    /// # Safety
    /// `ptr` must be nil or point at a live string object.
    pub unsafe fn from_pointer<'a>(ptr: Pointer) -> Option<&'a StringObject> {
        unsafe { (ptr as *const StringObject).as_ref() }
    }

    pub fn ty(&self) -> Option<&TypeRef> {
        self.header.ty()
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: only ever filled from &str, len bytes long
        unsafe { str::from_utf8_unchecked(slice::from_raw_parts(self.data.as_ptr(), self.len)) }
    }

    pub fn c_str(&self) -> &CStr {
        // SAFETY: NUL terminated in setn
        unsafe { CStr::from_ptr(self.data.as_ptr() as *const c_char) }
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.len
    }

    pub fn num_chars(&self) -> usize {
        self.as_str().chars().count()
    }

    /// ELF hash of the UTF-8 bytes.
    pub fn hash(&self) -> u32 {
        let mut h: u32 = 0;
        for &byte in self.as_str().as_bytes() {
            h = (h << 4).wrapping_add(byte as u32);
            let g = h & 0xf000_0000;
            if g != 0 {
                h ^= g >> 24;
            }
            h &= !g;
        }
        h
    }
}

unsafe fn string<'a>(ptr: Pointer) -> Option<&'a StringObject> {
    unsafe { StringObject::from_pointer(ptr) }
}

fn required<'a>(ptr: Pointer) -> Result<&'a StringObject, RuntimeError> {
    // SAFETY: string operands are strings or nil
    unsafe { string(ptr) }.ok_or(RuntimeError::nil())
}

/// Allocates a new string of the context's string type.
pub fn allocate(thread: &Thread, text: &str) -> Pointer {
    let ty = thread.context().types().string.clone();
    let heap = thread.heap();
    heap.allocate_object(StringObject::new(heap, ty, text)).as_ptr() as Pointer
}

/// Text of a string value; `None` for nil.
pub fn text(ptr: Pointer) -> Option<String> {
    // SAFETY: see required
    unsafe { string(ptr) }.map(|s| s.as_str().to_string())
}

fn text_or_nil<'a>(ptr: Pointer) -> &'a str {
    // SAFETY: see required
    unsafe { string(ptr) }.map_or("nil", |s| s.as_str())
}

// ── construction ───────────────────────────────────────────────────────

pub fn from_int(thread: &Thread, value: i32) -> Pointer {
    allocate(thread, &value.to_string())
}

pub fn from_int64(thread: &Thread, value: i64) -> Pointer {
    allocate(thread, &value.to_string())
}

pub fn from_double(thread: &Thread, value: f64) -> Result<Pointer, RuntimeError> {
    Ok(allocate(thread, &snprintf(c"%f", CArg::Double(value))?))
}

pub fn from_float(thread: &Thread, value: f32) -> Result<Pointer, RuntimeError> {
    from_double(thread, value as f64)
}

/// Bytes render unsigned.
pub fn from_byte(thread: &Thread, value: u8) -> Pointer {
    allocate(thread, &value.to_string())
}

pub fn from_bool(thread: &Thread, value: bool) -> Pointer {
    allocate(thread, if value { "true" } else { "false" })
}

pub fn from_vector(thread: &Thread, components: &[f32]) -> Pointer {
    let parts: Vec<_> = components.iter().map(|c| g_text(*c as f64)).collect();
    allocate(thread, &format!("<{}>", parts.join(", ")))
}

/// Copy; nil becomes the text "nil".
pub fn from_string(thread: &Thread, source: Pointer) -> Pointer {
    allocate(thread, text_or_nil(source))
}

/// Class, interface and variant values render through their own type.
pub fn from_object(thread: &Thread, object: Pointer) -> Result<Pointer, RuntimeError> {
    // SAFETY: object operands are heap objects or nil
    let header = unsafe { Object::from_pointer(object) }.ok_or(RuntimeError::nil())?;
    let text = match header.ty() {
        Some(ty) => ty.output_value(Value::new(object)),
        None => format!("<#opaque {:p}>", object),
    };
    Ok(allocate(thread, &text))
}

pub fn from_opaque(thread: &Thread, object: Pointer) -> Result<Pointer, RuntimeError> {
    if object.is_null() {
        return Err(RuntimeError::nil());
    }
    Ok(allocate(thread, &format!("<#opaque {:p}>", object)))
}

// ── operators ──────────────────────────────────────────────────────────

/// Concatenation renders nil operands as "nil" rather than failing.
pub fn concatenate(thread: &Thread, a: Pointer, b: Pointer) -> Pointer {
    let mut text = String::from(text_or_nil(a));
    text.push_str(text_or_nil(b));
    allocate(thread, &text)
}

/// `a += b` through a reference to the left operand's slot.
pub fn append(thread: &Thread, slot: Pointer, b: Pointer) -> Result<Pointer, RuntimeError> {
    let slot = slot as *mut Pointer;
    if slot.is_null() {
        return Err(RuntimeError::nil());
    }
    // SAFETY: reference nodes hand out live slot addresses, which class
    // member slots may leave unaligned
    unsafe { slot.write_unaligned(concatenate(thread, slot.read_unaligned(), b)) };
    Ok(slot as Pointer)
}

/// `a = b` through a reference to the left operand's slot.
pub fn assign(slot: Pointer, b: Pointer) -> Result<Pointer, RuntimeError> {
    let slot = slot as *mut Pointer;
    if slot.is_null() {
        return Err(RuntimeError::nil());
    }
    // SAFETY: as in append
    unsafe { slot.write_unaligned(b) };
    Ok(slot as Pointer)
}

pub fn equals(a: Pointer, b: Pointer) -> Result<bool, RuntimeError> {
    Ok(required(a)?.as_str() == required(b)?.as_str())
}

pub fn not_equals(a: Pointer, b: Pointer) -> Result<bool, RuntimeError> {
    let (x, y) = (required(a)?, required(b)?);
    Ok(a != b && x.as_str() != y.as_str())
}

/// Three-way comparison by code point.
pub fn compare(a: Pointer, b: Pointer) -> Result<i32, RuntimeError> {
    let (x, y) = (required(a)?, required(b)?);
    Ok(match x.as_str().chars().cmp(y.as_str().chars()) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    })
}

// ── conversions ────────────────────────────────────────────────────────

/// C `atoi`: leading numeric prefix, 0 when there is none.
pub fn to_int(a: Pointer) -> Result<i32, RuntimeError> {
    let s = required(a)?;
    // SAFETY: NUL terminated
    Ok(unsafe { libc::atoi(s.c_str().as_ptr()) })
}

pub fn to_double(a: Pointer) -> Result<f64, RuntimeError> {
    let s = required(a)?;
    // SAFETY: NUL terminated
    Ok(unsafe { libc::atof(s.c_str().as_ptr()) })
}

pub fn to_float(a: Pointer) -> Result<f32, RuntimeError> {
    to_double(a).map(|d| d as f32)
}

pub fn to_bool(a: Pointer) -> Result<bool, RuntimeError> {
    Ok(required(a)?.as_str() == "true")
}

// ── queries ────────────────────────────────────────────────────────────

pub fn size(a: Pointer) -> Result<i32, RuntimeError> {
    Ok(required(a)?.num_chars() as i32)
}

pub fn hash(a: Pointer) -> Result<i32, RuntimeError> {
    Ok(required(a)?.hash() as i32)
}

/// Code point at a character index; negative indices count from the end.
pub fn index(a: Pointer, i: i32) -> Result<i32, RuntimeError> {
    let s = required(a)?;
    let length = s.num_chars();
    let adjusted = if i < 0 { i as i64 + length as i64 } else { i as i64 };
    let out_of_range = RuntimeError::OutOfRange {
        index: adjusted,
        length,
    };
    if adjusted < 0 {
        return Err(out_of_range);
    }
    s.as_str()
        .chars()
        .nth(adjusted as usize)
        .map(|c| c as i32)
        .ok_or(out_of_range)
}

/// Characters `start..start + len`. A negative start counts from the end;
/// a non-positive length is measured back from the end.
pub fn substr(thread: &Thread, a: Pointer, start: i32, len: i32) -> Result<Pointer, RuntimeError> {
    let s = required(a)?;
    let length = s.num_chars() as i64;
    let mut start = start as i64;
    let mut len = len as i64;
    if start < 0 {
        start += length;
    }
    if len <= 0 {
        len = length + len - start;
    }
    if start + len > length {
        len = length - start;
    }
    let start = start.clamp(0, length) as usize;
    let len = len.clamp(0, length) as usize;

    let text = s.as_str();
    let begin = text.char_indices().nth(start).map_or(text.len(), |(i, _)| i);
    let end = text[begin..]
        .char_indices()
        .nth(len)
        .map_or(text.len(), |(i, _)| begin + i);
    Ok(allocate(thread, &text[begin..end]))
}

/// Splits at each occurrence of `delimiter` when `sequence` is set,
/// otherwise at any of its characters, dropping empty pieces.
pub fn split(thread: &Thread, a: Pointer, delimiter: Pointer, sequence: bool) -> Result<Pointer, RuntimeError> {
    let (s, d) = (required(a)?, required(delimiter)?);
    let text = s.as_str();
    let delimiter = d.as_str();

    let pieces: Vec<&str> = if sequence {
        let mut pieces = Vec::new();
        let mut from = 0;
        while from < text.len() {
            match text[from..].find(delimiter).filter(|_| !delimiter.is_empty()) {
                Some(at) => {
                    pieces.push(&text[from..from + at]);
                    from += at + delimiter.len();
                }
                None => {
                    pieces.push(&text[from..]);
                    break;
                }
            }
        }
        pieces
    } else {
        text.split(|c| delimiter.contains(c))
            .filter(|piece| !piece.is_empty())
            .collect()
    };

    let values = pieces
        .into_iter()
        .map(|piece| Value::new(allocate(thread, piece)))
        .collect();
    let ty = thread.context().types().string_array.clone();
    Ok(DynamicArray::allocate(thread.heap(), ty, values))
}

/// Elements with `separator` between them; nil elements render as "nil".
pub fn join(thread: &Thread, array: Pointer, separator: Pointer) -> Result<Pointer, RuntimeError> {
    // SAFETY: the operand is a string array or nil
    let array = unsafe { DynamicArray::from_pointer(array) }.ok_or(RuntimeError::nil())?;
    let separator = required(separator)?.as_str();
    let text = array
        .values()
        .iter()
        .map(|v| text_or_nil(unsafe { v.pointer }))
        .collect::<Vec<_>>()
        .join(separator);
    Ok(allocate(thread, &text))
}

pub fn print(a: Pointer) {
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(text_or_nil(a).as_bytes());
    let _ = out.flush();
}

// ── node functions ─────────────────────────────────────────────────────

/// Native string operation as registered with the context.
pub struct NativeDesc {
    pub name: &'static str,
    pub arity: usize,
    pub func: NodeFunc,
}

impl NativeDesc {
    const fn new(name: &'static str, arity: usize, func: NodeFunc) -> Self {
        Self { name, arity, func }
    }
}

fn pointer_arg(node: &Node, index: usize, thread: &mut Thread) -> Eval<Pointer> {
    node.arg(index).eval::<Pointer>(thread)
}

fn construct(_node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    Ok(allocate(thread, ""))
}

fn string_from_int(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let value = node.arg(0).eval::<i32>(thread)?;
    Ok(from_int(thread, value))
}

fn string_from_int64(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let value = node.arg(0).eval::<i64>(thread)?;
    Ok(from_int64(thread, value))
}

fn string_from_float(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let value = node.arg(0).eval::<f32>(thread)?;
    Ok(from_float(thread, value)?)
}

fn string_from_double(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let value = node.arg(0).eval::<f64>(thread)?;
    Ok(from_double(thread, value)?)
}

fn string_from_byte(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let value = node.arg(0).eval::<u8>(thread)?;
    Ok(from_byte(thread, value))
}

fn string_from_bool(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let value = node.arg(0).eval::<bool>(thread)?;
    Ok(from_bool(thread, value))
}

fn string_from_vector4(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let value = node.arg(0).eval::<Vector4f>(thread)?;
    Ok(from_vector(thread, &value.0))
}

fn string_from_vector3(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let value = node.arg(0).eval::<Vector3f>(thread)?;
    Ok(from_vector(thread, &value.0))
}

fn string_from_vector2(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let value = node.arg(0).eval::<Vector2f>(thread)?;
    Ok(from_vector(thread, &value.0))
}

fn string_from_string(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let source = pointer_arg(node, 0, thread)?;
    Ok(from_string(thread, source))
}

fn string_from_object(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let object = pointer_arg(node, 0, thread)?;
    Ok(from_object(thread, object)?)
}

fn string_from_opaque(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let object = pointer_arg(node, 0, thread)?;
    Ok(from_opaque(thread, object)?)
}

fn plus(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let a = pointer_arg(node, 0, thread)?;
    let b = pointer_arg(node, 1, thread)?;
    Ok(concatenate(thread, a, b))
}

fn assign_plus(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let slot = pointer_arg(node, 0, thread)?;
    let b = pointer_arg(node, 1, thread)?;
    Ok(append(thread, slot, b)?)
}

fn assign_string(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let slot = pointer_arg(node, 0, thread)?;
    let b = pointer_arg(node, 1, thread)?;
    Ok(assign(slot, b)?)
}

fn string_to_int(node: &Node, thread: &mut Thread) -> Eval<i32> {
    Ok(to_int(pointer_arg(node, 0, thread)?)?)
}

fn string_to_float(node: &Node, thread: &mut Thread) -> Eval<f32> {
    Ok(to_float(pointer_arg(node, 0, thread)?)?)
}

fn string_to_double(node: &Node, thread: &mut Thread) -> Eval<f64> {
    Ok(to_double(pointer_arg(node, 0, thread)?)?)
}

fn string_to_bool(node: &Node, thread: &mut Thread) -> Eval<bool> {
    Ok(to_bool(pointer_arg(node, 0, thread)?)?)
}

fn string_equals(node: &Node, thread: &mut Thread) -> Eval<bool> {
    let a = pointer_arg(node, 0, thread)?;
    let b = pointer_arg(node, 1, thread)?;
    Ok(equals(a, b)?)
}

fn string_not_equals(node: &Node, thread: &mut Thread) -> Eval<bool> {
    let a = pointer_arg(node, 0, thread)?;
    let b = pointer_arg(node, 1, thread)?;
    Ok(not_equals(a, b)?)
}

fn string_compare(node: &Node, thread: &mut Thread) -> Eval<i32> {
    let a = pointer_arg(node, 0, thread)?;
    let b = pointer_arg(node, 1, thread)?;
    Ok(compare(a, b)?)
}

fn string_size(node: &Node, thread: &mut Thread) -> Eval<i32> {
    Ok(size(pointer_arg(node, 0, thread)?)?)
}

fn string_hash(node: &Node, thread: &mut Thread) -> Eval<i32> {
    Ok(hash(pointer_arg(node, 0, thread)?)?)
}

fn string_index(node: &Node, thread: &mut Thread) -> Eval<i32> {
    let a = pointer_arg(node, 0, thread)?;
    let i = node.arg(1).eval::<i32>(thread)?;
    Ok(index(a, i)?)
}

fn string_substr(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let a = pointer_arg(node, 0, thread)?;
    let start = node.arg(1).eval::<i32>(thread)?;
    let len = node.arg(2).eval::<i32>(thread)?;
    Ok(substr(thread, a, start, len)?)
}

fn string_split(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let a = pointer_arg(node, 0, thread)?;
    let delimiter = pointer_arg(node, 1, thread)?;
    let sequence = node.arg(2).eval::<bool>(thread)?;
    Ok(split(thread, a, delimiter, sequence)?)
}

fn string_join(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let array = pointer_arg(node, 0, thread)?;
    let separator = pointer_arg(node, 1, thread)?;
    Ok(join(thread, array, separator)?)
}

fn string_print(node: &Node, thread: &mut Thread) -> Eval<()> {
    print(pointer_arg(node, 0, thread)?);
    Ok(())
}

/// The string library, keyed by operator or signature.
pub fn natives() -> Vec<NativeDesc> {
    use NodeFunc::{Bool, Double, Float, Int, Void};
    use NodeFunc::Pointer as Ptr;

    vec![
        NativeDesc::new("string()", 0, Ptr(construct)),
        NativeDesc::new("string(int)", 1, Ptr(string_from_int)),
        NativeDesc::new("string(int64)", 1, Ptr(string_from_int64)),
        NativeDesc::new("string(float)", 1, Ptr(string_from_float)),
        NativeDesc::new("string(double)", 1, Ptr(string_from_double)),
        NativeDesc::new("string(byte)", 1, Ptr(string_from_byte)),
        NativeDesc::new("string(bool)", 1, Ptr(string_from_bool)),
        NativeDesc::new("string(Vector4f)", 1, Ptr(string_from_vector4)),
        NativeDesc::new("string(Vector3f)", 1, Ptr(string_from_vector3)),
        NativeDesc::new("string(Vector2f)", 1, Ptr(string_from_vector2)),
        NativeDesc::new("string(string)", 1, Ptr(string_from_string)),
        NativeDesc::new("string(class)", 1, Ptr(string_from_object)),
        NativeDesc::new("string(variant)", 1, Ptr(string_from_object)),
        NativeDesc::new("string(opaque)", 1, Ptr(string_from_opaque)),
        NativeDesc::new("+", 2, Ptr(plus)),
        NativeDesc::new("+=", 2, Ptr(assign_plus)),
        NativeDesc::new("=", 2, Ptr(assign_string)),
        NativeDesc::new("int(string)", 1, Int(string_to_int)),
        NativeDesc::new("float(string)", 1, Float(string_to_float)),
        NativeDesc::new("double(string)", 1, Double(string_to_double)),
        NativeDesc::new("bool(string)", 1, Bool(string_to_bool)),
        NativeDesc::new("==", 2, Bool(string_equals)),
        NativeDesc::new("!=", 2, Bool(string_not_equals)),
        NativeDesc::new("compare", 2, Int(string_compare)),
        NativeDesc::new("size", 1, Int(string_size)),
        NativeDesc::new("hash", 1, Int(string_hash)),
        NativeDesc::new("[]", 2, Int(string_index)),
        NativeDesc::new("substr", 3, Ptr(string_substr)),
        NativeDesc::new("split", 3, Ptr(string_split)),
        NativeDesc::new("join", 2, Ptr(string_join)),
        NativeDesc::new("print", 1, Void(string_print)),
        NativeDesc::new("%(tuple)", 2, Ptr(format::format_tuple_node)),
        NativeDesc::new("%(int)", 2, Ptr(format::format_int)),
        NativeDesc::new("%(int64)", 2, Ptr(format::format_int64)),
        NativeDesc::new("%(float)", 2, Ptr(format::format_float)),
        NativeDesc::new("%(double)", 2, Ptr(format::format_double)),
        NativeDesc::new("%(half)", 2, Ptr(format::format_half)),
        NativeDesc::new("%(short)", 2, Ptr(format::format_short)),
        NativeDesc::new("%(char)", 2, Ptr(format::format_char)),
        NativeDesc::new("%(byte)", 2, Ptr(format::format_byte)),
        NativeDesc::new("%(bool)", 2, Ptr(format::format_bool)),
        NativeDesc::new("%(Vector4f)", 2, Ptr(format::format_vector4f)),
        NativeDesc::new("%(Vector3f)", 2, Ptr(format::format_vector3f)),
        NativeDesc::new("%(Vector2f)", 2, Ptr(format::format_vector2f)),
        NativeDesc::new("%(char[])", 2, Ptr(format::format_char_array)),
        NativeDesc::new("%(class)", 2, Ptr(format::format_object_node)),
        NativeDesc::new("%(opaque)", 2, Ptr(format::format_opaque_node)),
    ]
}
