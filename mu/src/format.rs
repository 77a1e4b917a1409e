//! The string `%` operator. Directives are matched one at a time and each
//! consumed argument is rendered by the C library's `snprintf` with a
//! length modifier chosen from the argument's type.
use std::ffi::{CStr, CString, c_char, c_double, c_int, c_longlong, c_uint};

use log::warn;

use crate::{
    ClassInstance, Context, DynamicArray, Eval, Native, Node, Pointer, RepKind, RuntimeError,
    StringObject, Thread, TypeKind, TypeRef, Value, Vector2f, Vector3f, Vector4f, half_to_float,
    strings,
};

/// One queued argument; a missing type marks an untyped opaque pointer.
#[derive(Clone)]
pub struct FormatArg {
    pub ty: Option<TypeRef>,
    pub value: Value,
}

impl FormatArg {
    pub fn new(ty: &TypeRef, value: Value) -> Self {
        Self {
            ty: Some(ty.clone()),
            value,
        }
    }

    pub fn opaque(ptr: Pointer) -> Self {
        Self {
            ty: None,
            value: Value::new(ptr),
        }
    }
}

// ── snprintf ───────────────────────────────────────────────────────────

/// Arguments after C default promotion.
#[derive(Clone, Copy)]
pub(crate) enum CArg<'a> {
    Int(c_int),
    Unsigned(c_uint),
    LongLong(c_longlong),
    Double(c_double),
    Str(&'a CStr),
}

const INITIAL_BUFFER: usize = 128;
const MAX_BUFFER: usize = 1 << 24;

/// Renders one directive, growing the buffer until the output fits.
pub(crate) fn snprintf(directive: &CStr, arg: CArg<'_>) -> Result<String, RuntimeError> {
    let mut buffer = vec![0u8; INITIAL_BUFFER];
    loop {
        let out = buffer.as_mut_ptr() as *mut c_char;
        let size = buffer.len();
        let format = directive.as_ptr();
        // SAFETY: buffer holds `size` bytes; each directive is paired with
        // the promoted argument type its conversion expects
        let n = unsafe {
            match arg {
                CArg::Int(v) => libc::snprintf(out, size, format, v),
                CArg::Unsigned(v) => libc::snprintf(out, size, format, v),
                CArg::LongLong(v) => libc::snprintf(out, size, format, v),
                CArg::Double(v) => libc::snprintf(out, size, format, v),
                CArg::Str(v) => libc::snprintf(out, size, format, v.as_ptr()),
            }
        };
        if n >= 0 && (n as usize) < size {
            buffer.truncate(n as usize);
            return Ok(String::from_utf8_lossy(&buffer).into_owned());
        }
        // a negative count carries no size hint
        let grown = if n < 0 { size * 2 } else { n as usize + 1 };
        if grown > MAX_BUFFER {
            return Err(RuntimeError::BadFormatString(
                directive.to_string_lossy().into_owned(),
            ));
        }
        buffer.resize(grown, 0);
    }
}

/// `%g` rendering.
pub(crate) fn g_text(value: f64) -> String {
    snprintf(c"%g", CArg::Double(value)).unwrap_or_default()
}

/// Stream rendering of floating point values: `%g`, with `.0` marking
/// integral values.
pub(crate) fn float_text(value: f64) -> String {
    let mut text = g_text(value);
    if value.floor() == value {
        text.push_str(".0");
    }
    text
}

pub(crate) fn c_string(text: &str) -> CString {
    let head = text.split('\0').next().unwrap_or_default();
    CString::new(head).unwrap_or_default()
}

// ── directives ─────────────────────────────────────────────────────────

fn directive(token: &str) -> Result<CString, RuntimeError> {
    CString::new(token).map_err(|_| RuntimeError::BadFormatString(token.escape_debug().to_string()))
}

/// Replaces the conversion letter at the end of `token`.
fn with_conversion(token: &str, conversion: &str) -> Result<CString, RuntimeError> {
    directive(&format!("{}{}", &token[..token.len() - 1], conversion))
}

fn convert(token: &str, key: char, argnum: usize, arg: &FormatArg) -> Result<String, RuntimeError> {
    let bad_type = || RuntimeError::BadArgumentType {
        argument: argnum + 1,
        conversion: key,
        type_name: arg
            .ty
            .as_ref()
            .map_or_else(|| "opaque".to_string(), |t| t.fully_qualified_name().to_string()),
    };
    let kind = arg.ty.as_ref().map(|t| t.kind());
    let value = arg.value;

    // SAFETY: each arm reads the field belonging to the argument's type
    unsafe {
        match key {
            'd' | 'D' | 'o' | 'u' | 'X' | 'x' => match kind {
                Some(TypeKind::Int | TypeKind::Char) => {
                    snprintf(&directive(token)?, CArg::Int(value.int))
                }
                Some(TypeKind::Short) => snprintf(
                    &with_conversion(token, &format!("h{key}"))?,
                    CArg::Int(value.short as c_int),
                ),
                Some(TypeKind::Byte) => snprintf(
                    &with_conversion(token, "hu")?,
                    CArg::Unsigned(value.char as c_uint),
                ),
                Some(TypeKind::Int64) => snprintf(
                    &with_conversion(token, &format!("ll{key}"))?,
                    CArg::LongLong(value.int64),
                ),
                _ => Err(bad_type()),
            },
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' => {
                let number = match kind {
                    Some(TypeKind::Float) => value.float as f64,
                    Some(TypeKind::Double) => value.double,
                    Some(TypeKind::Half) => half_to_float(value.short) as f64,
                    _ => return Err(bad_type()),
                };
                snprintf(&directive(token)?, CArg::Double(number))
            }
            'c' => match kind {
                Some(TypeKind::Char) => Ok(char::from_u32(value.int as u32)
                    .unwrap_or(char::REPLACEMENT_CHARACTER)
                    .to_string()),
                _ => Err(bad_type()),
            },
            's' => {
                let token = directive(token)?;
                let text = match kind {
                    Some(TypeKind::String) => {
                        let text = StringObject::from_pointer(value.pointer).map_or(c"nil", |s| s.c_str());
                        return snprintf(&token, CArg::Str(text));
                    }
                    Some(TypeKind::Array { element }) if element.is_char() => {
                        match DynamicArray::from_pointer(value.pointer) {
                            Some(array) => array
                                .values()
                                .iter()
                                .map(|c| char::from_u32(c.int as u32).unwrap_or(char::REPLACEMENT_CHARACTER))
                                .collect(),
                            None => "nil".to_string(),
                        }
                    }
                    _ => match &arg.ty {
                        Some(ty) => ty.output_value(value),
                        None => format!("<#opaque {:p}>", value.pointer),
                    },
                };
                snprintf(&token, CArg::Str(&c_string(&text)))
            }
            _ => {
                warn!(
                    "format directive {:?} has an unknown conversion; argument {} is skipped",
                    token,
                    argnum + 1
                );
                Ok(String::new())
            }
        }
    }
}

/// Expands `fmt` against `args`.
pub fn render(context: &Context, fmt: &str, args: &[FormatArg]) -> Result<String, RuntimeError> {
    let pattern = context.format_directive();
    let mut out = String::with_capacity(fmt.len());
    let mut argnum = 0;
    let mut pos = 0;

    while pos < fmt.len() {
        let Some(captures) = pattern.captures_at(fmt, pos) else {
            break;
        };
        let end = captures.get(0).map_or(pos, |m| m.end());
        if end == pos {
            // a '%' that starts no directive stands for itself
            out.push('%');
            pos += 1;
            continue;
        }
        if let Some(literal) = captures.get(1) {
            out.push_str(literal.as_str());
        }
        if let Some(found) = captures.get(2) {
            let token = found.as_str();
            let key = token.chars().last().unwrap_or('%');
            if key == '%' {
                out.push('%');
            } else {
                let Some(arg) = args.get(argnum) else {
                    warn!(
                        "format operator ran out of arguments at directive {} of {:?}",
                        argnum + 1,
                        fmt
                    );
                    break;
                };
                out.push_str(&convert(token, key, argnum, arg)?);
                argnum += 1;
            }
        }
        pos = end;
    }

    Ok(out)
}

/// `fmt % args`, allocating the result string.
pub fn format(thread: &mut Thread, fmt: Pointer, args: &[FormatArg]) -> Result<Pointer, RuntimeError> {
    // SAFETY: the format operand is a string or nil
    let fmt = unsafe { StringObject::from_pointer(fmt) }.ok_or(RuntimeError::nil())?;
    let text = render(thread.context(), fmt.as_str(), args)?;
    Ok(strings::allocate(thread, &text))
}

/// Tuple form: every field becomes one argument, read by its
/// representation.
pub fn format_tuple(thread: &mut Thread, fmt: Pointer, tuple: Pointer) -> Result<Pointer, RuntimeError> {
    // SAFETY: the operand is a tuple instance or nil
    let instance = unsafe { ClassInstance::from_pointer(tuple) }.ok_or(RuntimeError::NilArgument {
        detail: ": nil tuple argument to format operator (%)",
    })?;
    let fields = instance.ty().and_then(|t| t.class()).map_or(&[][..], |c| c.fields());
    let mut args = Vec::with_capacity(fields.len());
    for field in fields {
        let src = instance.member_ptr(field.offset, 0)?;
        // SAFETY: the layout reserved the field's size at its offset
        let value = unsafe {
            match field.ty.rep() {
                RepKind::Float
                | RepKind::Double
                | RepKind::Int
                | RepKind::Int64
                | RepKind::Short
                | RepKind::Char
                | RepKind::Bool
                | RepKind::Vector4f
                | RepKind::Vector3f
                | RepKind::Vector2f
                | RepKind::Pointer => field.ty.rep().load(src),
                // no branch reads void fields; they format as zero
                RepKind::Void => Value::ZERO,
            }
        };
        args.push(FormatArg::new(&field.ty, value));
    }
    format(thread, fmt, &args)
}

/// Class-not-tuple form: the instance's own type renders it.
pub fn format_object(thread: &mut Thread, fmt: Pointer, object: Pointer) -> Result<Pointer, RuntimeError> {
    // SAFETY: the operand is a class instance or nil
    let ty = unsafe { ClassInstance::from_pointer(object) }.and_then(|o| o.ty().cloned());
    format(thread, fmt, &[FormatArg { ty, value: Value::new(object) }])
}

pub fn format_opaque(thread: &mut Thread, fmt: Pointer, object: Pointer) -> Result<Pointer, RuntimeError> {
    format(thread, fmt, &[FormatArg::opaque(object)])
}

// ── node functions ─────────────────────────────────────────────────────

fn format_with<T: Native>(
    node: &Node,
    thread: &mut Thread,
    ty: fn(&Context) -> &TypeRef,
) -> Eval<Pointer> {
    let fmt = node.arg(0).eval::<Pointer>(thread)?;
    let value = node.arg(1).eval::<T>(thread)?.into_value();
    let ty = ty(thread.context()).clone();
    Ok(format(thread, fmt, &[FormatArg::new(&ty, value)])?)
}

pub fn format_int(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    format_with::<i32>(node, thread, |c| &c.types().int)
}

pub fn format_int64(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    format_with::<i64>(node, thread, |c| &c.types().int64)
}

pub fn format_float(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    format_with::<f32>(node, thread, |c| &c.types().float)
}

pub fn format_double(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    format_with::<f64>(node, thread, |c| &c.types().double)
}

pub fn format_half(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    format_with::<i16>(node, thread, |c| &c.types().half)
}

pub fn format_short(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    format_with::<i16>(node, thread, |c| &c.types().short)
}

pub fn format_char(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    format_with::<i32>(node, thread, |c| &c.types().char)
}

pub fn format_byte(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    format_with::<u8>(node, thread, |c| &c.types().byte)
}

pub fn format_bool(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    format_with::<bool>(node, thread, |c| &c.types().bool)
}

pub fn format_vector4f(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    format_with::<Vector4f>(node, thread, |c| &c.types().vec4f)
}

pub fn format_vector3f(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    format_with::<Vector3f>(node, thread, |c| &c.types().vec3f)
}

pub fn format_vector2f(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    format_with::<Vector2f>(node, thread, |c| &c.types().vec2f)
}

pub fn format_char_array(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    format_with::<Pointer>(node, thread, |c| &c.types().char_array)
}

pub fn format_tuple_node(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let fmt = node.arg(0).eval::<Pointer>(thread)?;
    let tuple = node.arg(1).eval::<Pointer>(thread)?;
    Ok(format_tuple(thread, fmt, tuple)?)
}

pub fn format_object_node(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let fmt = node.arg(0).eval::<Pointer>(thread)?;
    let object = node.arg(1).eval::<Pointer>(thread)?;
    Ok(format_object(thread, fmt, object)?)
}

pub fn format_opaque_node(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let fmt = node.arg(0).eval::<Pointer>(thread)?;
    let object = node.arg(1).eval::<Pointer>(thread)?;
    Ok(format_opaque(thread, fmt, object)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MachineCreateInfo, test_thread};
    use std::sync::Arc;

    struct Fixture {
        context: Arc<Context>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                context: Context::new(MachineCreateInfo::default()),
            }
        }

        fn render(&self, fmt: &str, args: &[FormatArg]) -> Result<String, RuntimeError> {
            render(&self.context, fmt, args)
        }

        fn arg<T: Native>(&self, ty: fn(&crate::StandardTypes) -> &TypeRef, value: T) -> FormatArg {
            FormatArg::new(ty(self.context.types()), Value::new(value))
        }
    }

    #[test]
    fn integer_conversions_take_length_modifiers() {
        let fx = Fixture::new();
        let int = fx.arg(|t| &t.int, -42i32);
        assert_eq!(fx.render("%d|%5d|%-4d|", &[int.clone(), int.clone(), fx.arg(|t| &t.int, 7i32)]), Ok("-42|  -42|7   |".into()));
        assert_eq!(fx.render("%x %X %o", &[fx.arg(|t| &t.int, 255i32), fx.arg(|t| &t.int, 255i32), fx.arg(|t| &t.int, 8i32)]), Ok("ff FF 10".into()));
        assert_eq!(fx.render("%d", &[fx.arg(|t| &t.short, -2i16)]), Ok("-2".into()));
        assert_eq!(fx.render("%x", &[fx.arg(|t| &t.short, -1i16)]), Ok("ffff".into()));
        assert_eq!(fx.render("%d", &[fx.arg(|t| &t.byte, 200u8)]), Ok("200".into()));
        assert_eq!(fx.render("%d", &[fx.arg(|t| &t.int64, 1i64 << 40)]), Ok("1099511627776".into()));
        assert_eq!(fx.render("%x", &[fx.arg(|t| &t.int64, -1i64)]), Ok("ffffffffffffffff".into()));
        assert_eq!(fx.render("%d", &[fx.arg(|t| &t.char, 'A' as i32)]), Ok("65".into()));
    }

    #[test]
    fn floating_conversions() {
        let fx = Fixture::new();
        assert_eq!(fx.render("%.2f", &[fx.arg(|t| &t.float, 1.5f32)]), Ok("1.50".into()));
        assert_eq!(fx.render("%e", &[fx.arg(|t| &t.double, 1234.5f64)]), Ok("1.234500e+03".into()));
        assert_eq!(fx.render("%g", &[fx.arg(|t| &t.double, 0.0001f64)]), Ok("0.0001".into()));
        assert_eq!(fx.render("%.1f", &[fx.arg(|t| &t.half, 0x3e00i16)]), Ok("1.5".into()));
        assert_eq!(
            fx.render("%f", &[fx.arg(|t| &t.int, 1i32)]),
            Err(RuntimeError::BadArgumentType {
                argument: 1,
                conversion: 'f',
                type_name: "int".into()
            })
        );
    }

    #[test]
    fn character_and_string_conversions() {
        let fx = Fixture::new();
        let mut thread = test_thread(&fx.context);
        assert_eq!(fx.render("[%c]", &[fx.arg(|t| &t.char, 'é' as i32)]), Ok("[é]".into()));
        assert!(matches!(
            fx.render("%c", &[fx.arg(|t| &t.int, 65i32)]),
            Err(RuntimeError::BadArgumentType { conversion: 'c', .. })
        ));

        let hello = strings::allocate(&mut thread, "hello");
        let string = |p: Pointer| FormatArg::new(&fx.context.types().string, Value::new(p));
        assert_eq!(fx.render("<%s>", &[string(hello)]), Ok("<hello>".into()));
        assert_eq!(fx.render("<%8s>", &[string(hello)]), Ok("<   hello>".into()));
        assert_eq!(fx.render("<%s>", &[string(std::ptr::null_mut())]), Ok("<nil>".into()));
        assert_eq!(fx.render("%s", &[fx.arg(|t| &t.bool, true)]), Ok("true".into()));
        assert_eq!(fx.render("%s", &[fx.arg(|t| &t.double, 2.0f64)]), Ok("2.0".into()));

        let chars = [104, 105].map(|c: i32| Value::new(c)).to_vec();
        let array = DynamicArray::allocate(fx.context.heap(), fx.context.types().char_array.clone(), chars);
        let char_array = FormatArg::new(&fx.context.types().char_array, Value::new(array));
        assert_eq!(fx.render("%s!", &[char_array]), Ok("hi!".into()));

        let opaque = fx.render("%s", &[FormatArg::opaque(0x10 as Pointer)]).expect("opaque");
        assert_eq!(opaque, "<#opaque 0x10>");
    }

    #[test]
    fn string_to_integer_conversion_is_rejected() {
        let fx = Fixture::new();
        let mut thread = test_thread(&fx.context);
        let hello = strings::allocate(&mut thread, "hello");
        let arg = FormatArg::new(&fx.context.types().string, Value::new(hello));
        let err = fx.render("%d", &[arg]).expect_err("string is not an integer");
        assert_eq!(
            err,
            RuntimeError::BadArgumentType {
                argument: 1,
                conversion: 'd',
                type_name: "string".into()
            }
        );
        assert!(matches!(
            fx.render("%d", &[FormatArg::opaque(std::ptr::null_mut())]),
            Err(RuntimeError::BadArgumentType { ref type_name, .. }) if type_name == "opaque"
        ));
    }

    #[test]
    fn percent_and_running_out_of_arguments() {
        let fx = Fixture::new();
        assert_eq!(fx.render("100%%", &[]), Ok("100%".into()));
        assert_eq!(fx.render("no directives", &[]), Ok("no directives".into()));
        assert_eq!(fx.render("", &[]), Ok("".into()));
        assert_eq!(
            fx.render("a=%d b=%d tail", &[fx.arg(|t| &t.int, 1i32)]),
            Ok("a=1 b=".into())
        );
        // a stray '%' without a conversion letter
        assert_eq!(fx.render("50%!", &[]), Ok("50%!".into()));
        assert_eq!(fx.render("%", &[]), Ok("%".into()));
    }

    #[test]
    fn unknown_conversions_skip_their_argument() {
        let fx = Fixture::new();
        let args = [fx.arg(|t| &t.int, 1i32), fx.arg(|t| &t.int, 2i32)];
        assert_eq!(fx.render("a%kb%d", &args), Ok("ab2".into()));
        assert_eq!(fx.render("%-4q|%d", &args), Ok("|2".into()));
    }

    #[test]
    fn tuple_form_formats_each_field() {
        let fx = Fixture::new();
        let mut thread = test_thread(&fx.context);
        let t = fx.context.types();
        let pair = fx.context.tuple_type(&[t.string.clone(), t.int.clone()]);
        let tuple = ClassInstance::allocate(fx.context.heap(), &pair);
        let x = strings::allocate(&mut thread, "x");
        let instance = unsafe { ClassInstance::from_pointer(tuple) }.expect("tuple");
        instance.set_field(0, Value::new(x)).expect("x");
        instance.set_field(1, Value::new(5i32)).expect("5");

        let fmt = strings::allocate(&mut thread, "%s and %d");
        let result = format_tuple(&mut thread, fmt, tuple).expect("format");
        assert_eq!(strings::text(result), Some("x and 5".to_string()));

        assert_eq!(
            format_tuple(&mut thread, fmt, std::ptr::null_mut()),
            Err(RuntimeError::NilArgument {
                detail: ": nil tuple argument to format operator (%)"
            })
        );
    }

    #[test]
    fn object_and_opaque_forms() {
        let fx = Fixture::new();
        let mut thread = test_thread(&fx.context);
        let class = fx.context.class_type("P", None, &[("x", fx.context.types().int.clone())]);
        let object = ClassInstance::allocate(fx.context.heap(), &class);
        let fmt = strings::allocate(&mut thread, "[%s]");
        let result = format_object(&mut thread, fmt, object).expect("object");
        assert_eq!(strings::text(result), Some("[P {0}]".to_string()));

        let nil = format_object(&mut thread, fmt, std::ptr::null_mut()).expect("nil object");
        assert_eq!(strings::text(nil), Some("[<#opaque 0x0>]".to_string()));
        let opaque = format_opaque(&mut thread, fmt, object).expect("opaque");
        assert!(strings::text(opaque).is_some_and(|s| s.starts_with("[<#opaque 0x")));
        assert_eq!(format(&mut thread, std::ptr::null_mut(), &[]), Err(RuntimeError::nil()));
    }

    #[test]
    fn wide_output_grows_the_buffer() {
        let fx = Fixture::new();
        let text = fx.render("%300d", &[fx.arg(|t| &t.int, 1i32)]).expect("wide");
        assert_eq!(text.len(), 300);
        assert!(text.ends_with(" 1"));
    }

    #[test]
    fn float_text_marks_integral_values() {
        assert_eq!(float_text(3.0), "3.0");
        assert_eq!(float_text(-0.5), "-0.5");
        assert_eq!(float_text(1e20), "1e+20.0");
        assert_eq!(g_text(0.1), "0.1");
    }
}
