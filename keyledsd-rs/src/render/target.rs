/* Render target: the aligned RGBA pixel buffer every effect draws into.
 *
 * Entries [0, size) map one-to-one onto the device's keys in device-reported
 * order. The allocation is 32-byte aligned and padded to a multiple of eight
 * entries so the vector kernels may process whole registers past `size`;
 * padding entries always read as zero. */

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::render::accel;

/* One color entry, tightly packed in red, green, blue, alpha order. Alpha is
 * composition state only; the wire protocol carries RGB. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct RGBAColor {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub alpha: u8,
}

impl RGBAColor {
    pub const fn new(red: u8, green: u8, blue: u8, alpha: u8) -> Self {
        Self { red, green, blue, alpha }
    }

    /* Parse "#RGB", "#RRGGBB", "#RRGGBBAA" or one of a small set of color
     * names. Missing alpha defaults to opaque. */
    pub fn parse(text: &str) -> Option<Self> {
        if let Some(hex) = text.strip_prefix('#') {
            return match hex.len() {
                3 => {
                    let v = u32::from_str_radix(hex, 16).ok()?;
                    let (r, g, b) = ((v >> 8) & 0xf, (v >> 4) & 0xf, v & 0xf);
                    Some(Self::new((r * 17) as u8, (g * 17) as u8, (b * 17) as u8, 255))
                }
                6 => {
                    let v = u32::from_str_radix(hex, 16).ok()?;
                    Some(Self::new((v >> 16) as u8, (v >> 8) as u8, v as u8, 255))
                }
                8 => {
                    let v = u32::from_str_radix(hex, 16).ok()?;
                    Some(Self::new(
                        (v >> 24) as u8,
                        (v >> 16) as u8,
                        (v >> 8) as u8,
                        v as u8,
                    ))
                }
                _ => None,
            };
        }

        let named: &[(&str, (u8, u8, u8))] = &[
            ("black", (0, 0, 0)),
            ("white", (255, 255, 255)),
            ("red", (255, 0, 0)),
            ("green", (0, 255, 0)),
            ("blue", (0, 0, 255)),
            ("yellow", (255, 255, 0)),
            ("cyan", (0, 255, 255)),
            ("magenta", (255, 0, 255)),
            ("orange", (255, 165, 0)),
            ("purple", (128, 0, 128)),
            ("pink", (255, 192, 203)),
            ("gray", (128, 128, 128)),
            ("grey", (128, 128, 128)),
        ];
        if text.eq_ignore_ascii_case("transparent") {
            return Some(Self::new(0, 0, 0, 0));
        }
        named
            .iter()
            .find(|(name, _)| text.eq_ignore_ascii_case(name))
            .map(|&(_, (r, g, b))| Self::new(r, g, b, 255))
    }
}

impl fmt::Display for RGBAColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.alpha == 255 {
            write!(f, "#{:02x}{:02x}{:02x}", self.red, self.green, self.blue)
        } else {
            write!(
                f,
                "#{:02x}{:02x}{:02x}{:02x}",
                self.red, self.green, self.blue, self.alpha
            )
        }
    }
}

/* Eight RGBA entries per AVX2 register. */
const ALIGN_ENTRIES: usize = 8;
const ALIGN_BYTES: usize = 32;

const fn entry_size() -> usize {
    std::mem::size_of::<RGBAColor>()
}

/* Owned, move-only pixel buffer. `size` is the logical entry count, `capacity`
 * the allocated count (multiple of eight, zero-initialised padding). */
pub struct RenderTarget {
    colors: NonNull<RGBAColor>,
    size: usize,
    capacity: usize,
}

/* The buffer is plain data behind a unique owner. */
unsafe impl Send for RenderTarget {}

impl RenderTarget {
    pub fn new(size: usize) -> Self {
        if size == 0 {
            return Self::default();
        }
        let capacity = size.div_ceil(ALIGN_ENTRIES) * ALIGN_ENTRIES;
        let layout = match Layout::from_size_align(capacity * entry_size(), ALIGN_BYTES) {
            Ok(layout) => layout,
            Err(_) => std::alloc::handle_alloc_error(Layout::new::<RGBAColor>()),
        };
        /* SAFETY: layout has non-zero size; alloc_zeroed establishes the
         * all-padding-is-zero invariant. */
        let raw = unsafe { alloc_zeroed(layout) } as *mut RGBAColor;
        let colors = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => std::alloc::handle_alloc_error(layout),
        };
        Self { colors, size, capacity }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn fill(&mut self, color: RGBAColor) {
        self.as_mut_slice().fill(color);
    }

    pub fn as_slice(&self) -> &[RGBAColor] {
        if self.size == 0 {
            return &[];
        }
        /* SAFETY: colors points at `capacity >= size` initialised entries. */
        unsafe { std::slice::from_raw_parts(self.colors.as_ptr(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [RGBAColor] {
        if self.size == 0 {
            return &mut [];
        }
        /* SAFETY: as above, and we hold the unique owner mutably. */
        unsafe { std::slice::from_raw_parts_mut(self.colors.as_ptr(), self.size) }
    }

    pub fn as_mut_ptr(&mut self) -> *mut RGBAColor {
        self.colors.as_ptr()
    }

    /* Full allocation including padding, as raw bytes. Kernel input. */
    fn capacity_bytes(&self) -> &[u8] {
        if self.capacity == 0 {
            return &[];
        }
        unsafe {
            std::slice::from_raw_parts(self.colors.as_ptr() as *const u8, self.capacity * entry_size())
        }
    }

    fn capacity_bytes_mut(&mut self) -> &mut [u8] {
        if self.capacity == 0 {
            return &mut [];
        }
        unsafe {
            std::slice::from_raw_parts_mut(self.colors.as_ptr() as *mut u8, self.capacity * entry_size())
        }
    }
}

impl Default for RenderTarget {
    fn default() -> Self {
        Self {
            colors: NonNull::dangling(),
            size: 0,
            capacity: 0,
        }
    }
}

impl Deref for RenderTarget {
    type Target = [RGBAColor];
    fn deref(&self) -> &[RGBAColor] {
        self.as_slice()
    }
}

impl DerefMut for RenderTarget {
    fn deref_mut(&mut self) -> &mut [RGBAColor] {
        self.as_mut_slice()
    }
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        if self.capacity == 0 {
            return;
        }
        let layout = match Layout::from_size_align(self.capacity * entry_size(), ALIGN_BYTES) {
            Ok(layout) => layout,
            Err(_) => return,
        };
        unsafe { dealloc(self.colors.as_ptr() as *mut u8, layout) };
    }
}

/* Exchange two targets without copying pixel data. */
pub fn swap(lhs: &mut RenderTarget, rhs: &mut RenderTarget) {
    std::mem::swap(lhs, rhs);
}

/* Source-over composite of `src` onto `dst`, all channels 8-bit. Operates on
 * the full capacity, which is safe because padding is zero on both sides. */
pub fn blend(dst: &mut RenderTarget, src: &RenderTarget) {
    assert_eq!(dst.capacity(), src.capacity());
    accel::blend(dst.capacity_bytes_mut(), src.capacity_bytes());
}

/* Per-channel multiply of `src` into `dst`, used to attenuate a layer. */
pub fn multiply(dst: &mut RenderTarget, src: &RenderTarget) {
    assert_eq!(dst.capacity(), src.capacity());
    accel::multiply(dst.capacity_bytes_mut(), src.capacity_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_padded_and_aligned() {
        for size in [1usize, 7, 8, 9, 104, 120] {
            let target = RenderTarget::new(size);
            assert_eq!(target.len(), size);
            assert!(target.capacity() >= size);
            assert_eq!(target.capacity() % 8, 0);
            assert_eq!(target.as_slice().as_ptr() as usize % 32, 0);
        }
    }

    #[test]
    fn padding_reads_zero() {
        let target = RenderTarget::new(5);
        let bytes = target.capacity_bytes();
        assert!(bytes[5 * 4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn empty_target() {
        let target = RenderTarget::new(0);
        assert!(target.is_empty());
        assert_eq!(target.capacity(), 0);
    }

    #[test]
    fn swap_exchanges_buffers() {
        let mut a = RenderTarget::new(8);
        let mut b = RenderTarget::new(8);
        a.fill(RGBAColor::new(1, 2, 3, 4));
        swap(&mut a, &mut b);
        assert_eq!(b[0], RGBAColor::new(1, 2, 3, 4));
        assert_eq!(a[0], RGBAColor::default());
    }

    #[test]
    fn blend_covers_padding_without_corrupting_it() {
        /* size 5, capacity 8: kernels run over the full capacity */
        let mut dst = RenderTarget::new(5);
        let mut src = RenderTarget::new(5);
        dst.fill(RGBAColor::new(0, 0, 0, 255));
        src.fill(RGBAColor::new(255, 255, 255, 127));
        blend(&mut dst, &src);

        for px in dst.iter() {
            assert!((126..=128).contains(&px.red));
            assert_eq!(px.alpha, 255);
        }
        /* zero-blended-onto-zero padding stays zero */
        assert!(dst.capacity_bytes()[5 * 4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn multiply_white_identity_on_targets() {
        let mut dst = RenderTarget::new(9);
        dst.fill(RGBAColor::new(10, 20, 30, 40));
        let mut src = RenderTarget::new(9);
        src.fill(RGBAColor::new(255, 255, 255, 255));
        multiply(&mut dst, &src);
        assert!(dst.iter().all(|&c| c == RGBAColor::new(10, 20, 30, 40)));
    }

    #[test]
    fn parse_hex_colors() {
        assert_eq!(RGBAColor::parse("#ff8000"), Some(RGBAColor::new(255, 128, 0, 255)));
        assert_eq!(RGBAColor::parse("#ff800040"), Some(RGBAColor::new(255, 128, 0, 0x40)));
        assert_eq!(RGBAColor::parse("#f00"), Some(RGBAColor::new(255, 0, 0, 255)));
        assert_eq!(RGBAColor::parse("#ff80"), None);
        assert_eq!(RGBAColor::parse("#zzzzzz"), None);
    }

    #[test]
    fn parse_named_colors() {
        assert_eq!(RGBAColor::parse("white"), Some(RGBAColor::new(255, 255, 255, 255)));
        assert_eq!(RGBAColor::parse("Red"), Some(RGBAColor::new(255, 0, 0, 255)));
        assert_eq!(RGBAColor::parse("transparent"), Some(RGBAColor::new(0, 0, 0, 0)));
        assert_eq!(RGBAColor::parse("no-such-color"), None);
    }

    #[test]
    fn display_roundtrip() {
        let color = RGBAColor::new(255, 128, 0, 255);
        assert_eq!(color.to_string(), "#ff8000");
        assert_eq!(RGBAColor::parse(&color.to_string()), Some(color));
    }
}
