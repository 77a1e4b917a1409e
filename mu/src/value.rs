//! Value: one machine value, untagged. The active field is implied by the
//! representation of whatever produced it.
//!
//! Native: the Rust type backing one representation, used to instantiate
//! the per-representation node functions from a single generic definition.
use std::fmt;

use crate::{NodeFn, NodeFunc, RepKind};

/// Opaque heap or stack address.
pub type Pointer = *mut u8;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector2f(pub [f32; 2]);

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3f(pub [f32; 3]);

#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector4f(pub [f32; 4]);

#[repr(C)]
#[derive(Clone, Copy)]
pub union Value {
    pub float: f32,
    pub double: f64,
    pub int: i32,
    pub int64: i64,
    pub short: i16,
    pub char: u8,
    pub bool: bool,
    pub pointer: Pointer,
    pub vector2f: Vector2f,
    pub vector3f: Vector3f,
    pub vector4f: Vector4f,
}

// pointers stored here are owned by the heap or a thread stack
unsafe impl Send for Value {}
unsafe impl Sync for Value {}

impl Value {
    /// All bytes zero. Every constructor starts from here so no byte of a
    /// Value is ever uninitialized.
    pub const ZERO: Value = Value {
        vector4f: Vector4f([0.0; 4]),
    };

    #[inline]
    pub fn new<T: Native>(value: T) -> Self {
        value.into_value()
    }

    #[inline]
    pub fn from_pointer<T>(ptr: *mut T) -> Self {
        (ptr as Pointer).into_value()
    }

    /// Reads the value as `T`.
    ///
    /// # Safety
    /// `T` must match the representation the value was produced with.
    #[inline]
    pub unsafe fn get<T: Native>(self) -> T {
        unsafe { T::from_value(self) }
    }

    pub fn raw(&self) -> [u64; 2] {
        // SAFETY: same size, and all bytes are initialized (see ZERO)
        unsafe { std::mem::transmute::<Value, [u64; 2]>(*self) }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [lo, hi] = self.raw();
        write!(f, "Value({hi:#x}:{lo:#018x})")
    }
}

/// Rust side of a machine representation.
pub trait Native: Copy + 'static {
    const KIND: RepKind;

    fn into_value(self) -> Value;

    /// # Safety
    /// The active field of `value` must be the one belonging to `Self::KIND`.
    unsafe fn from_value(value: Value) -> Self;

    /// Zero, false, nil or the empty vector.
    #[inline]
    fn zero() -> Self {
        // SAFETY: the all-zero pattern is valid for every representation
        unsafe { Self::from_value(Value::ZERO) }
    }

    fn wrap(func: NodeFn<Self>) -> NodeFunc;

    fn unwrap(func: NodeFunc) -> Option<NodeFn<Self>>;
}

macro_rules! native {
    ($ty:ty, $kind:ident, $field:ident) => {
        impl Native for $ty {
            const KIND: RepKind = RepKind::$kind;

            #[inline]
            fn into_value(self) -> Value {
                let mut value = Value::ZERO;
                value.$field = self;
                value
            }

            #[inline]
            unsafe fn from_value(value: Value) -> Self {
                unsafe { value.$field }
            }

            #[inline]
            fn wrap(func: NodeFn<Self>) -> NodeFunc {
                NodeFunc::$kind(func)
            }

            #[inline]
            fn unwrap(func: NodeFunc) -> Option<NodeFn<Self>> {
                match func {
                    NodeFunc::$kind(f) => Some(f),
                    _ => None,
                }
            }
        }
    };
}

native!(f32, Float, float);
native!(f64, Double, double);
native!(i32, Int, int);
native!(i64, Int64, int64);
native!(i16, Short, short);
native!(u8, Char, char);
native!(bool, Bool, bool);
native!(Pointer, Pointer, pointer);
native!(Vector2f, Vector2f, vector2f);
native!(Vector3f, Vector3f, vector3f);
native!(Vector4f, Vector4f, vector4f);

impl Native for () {
    const KIND: RepKind = RepKind::Void;

    #[inline]
    fn into_value(self) -> Value {
        Value::ZERO
    }

    #[inline]
    unsafe fn from_value(_value: Value) -> Self {}

    #[inline]
    fn wrap(func: NodeFn<Self>) -> NodeFunc {
        NodeFunc::Void(func)
    }

    #[inline]
    fn unwrap(func: NodeFunc) -> Option<NodeFn<Self>> {
        match func {
            NodeFunc::Void(f) => Some(f),
            _ => None,
        }
    }
}

/// Float vectors addressed by component.
pub trait FloatVector: Native {
    const WIDTH: usize;

    fn components(&self) -> &[f32];
}

macro_rules! float_vector {
    ($ty:ident, $width:literal) => {
        impl FloatVector for $ty {
            const WIDTH: usize = $width;

            #[inline]
            fn components(&self) -> &[f32] {
                &self.0
            }
        }
    };
}

float_vector!(Vector2f, 2);
float_vector!(Vector3f, 3);
float_vector!(Vector4f, 4);

/// Widens IEEE 754 binary16 bits stored in a short slot.
pub fn half_to_float(bits: i16) -> f32 {
    let h = bits as u16;
    let sign = ((h >> 15) as u32) << 31;
    let exponent = ((h >> 10) & 0x1f) as u32;
    let mantissa = (h & 0x3ff) as u32;

    match exponent {
        0 if mantissa == 0 => f32::from_bits(sign),
        0 => {
            let magnitude = mantissa as f32 * f32::powi(2.0, -24);
            if sign != 0 { -magnitude } else { magnitude }
        }
        0x1f => f32::from_bits(sign | 0x7f80_0000 | (mantissa << 13)),
        _ => f32::from_bits(sign | ((exponent + 127 - 15) << 23) | (mantissa << 13)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_share_storage() {
        let v = Value::new(-1i32);
        assert_eq!(unsafe { v.get::<i32>() }, -1);
        assert_eq!(unsafe { v.short }, -1);
        assert_eq!(v.raw()[1], 0, "upper half stays zero");
    }

    #[test]
    fn value_holds_widest_vector() {
        assert_eq!(std::mem::size_of::<Value>(), 16);
        assert_eq!(std::mem::align_of::<Value>(), 16);
        let v = Value::new(Vector4f([1.0, 2.0, 3.0, 4.0]));
        assert_eq!(unsafe { v.get::<Vector4f>() }.components(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn native_wrap_round_trips() {
        fn seven(_: &crate::Node, _: &mut crate::Thread) -> crate::Eval<i32> {
            Ok(7)
        }
        let func = i32::wrap(seven);
        assert_eq!(func.kind(), RepKind::Int);
        assert!(i32::unwrap(func).is_some());
        assert!(f32::unwrap(func).is_none());
    }

    #[test]
    fn half_widening() {
        assert_eq!(half_to_float(0x3c00), 1.0);
        assert_eq!(half_to_float(0xc000u16 as i16), -2.0);
        assert_eq!(half_to_float(0x7bff), 65504.0);
        assert_eq!(half_to_float(0x0001), f32::powi(2.0, -24));
        assert!(half_to_float(0x7c00).is_infinite());
        assert!(half_to_float(0x7e00).is_nan());
        assert_eq!(half_to_float(0x8000u16 as i16).to_bits(), (-0.0f32).to_bits());
    }
}
