/* Compositing kernels: alpha blend and multiply over packed RGBA bytes.
 *
 * Three implementations are provided (plain, SSE2, AVX2); the best one the
 * CPU supports is selected once and cached. All three divide by 255 through
 * the same `(x * 0x8081) >> 23` reciprocal, which is exact for the operand
 * range here, so their outputs are bitwise identical. Callers pass the full
 * padded capacity of their buffers; length must be a multiple of 4. */

use std::sync::OnceLock;

type Kernel = fn(&mut [u8], &[u8]);

struct Kernels {
    blend: Kernel,
    multiply: Kernel,
}

fn kernels() -> &'static Kernels {
    static KERNELS: OnceLock<Kernels> = OnceLock::new();
    KERNELS.get_or_init(|| {
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("avx2") {
                return Kernels { blend: blend_avx2_entry, multiply: multiply_avx2_entry };
            }
            if is_x86_feature_detected!("sse2") {
                return Kernels { blend: blend_sse2_entry, multiply: multiply_sse2_entry };
            }
        }
        Kernels { blend: blend_plain, multiply: multiply_plain }
    })
}

/* Source-over blend of src onto dst. */
pub fn blend(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    debug_assert_eq!(dst.len() % 4, 0);
    (kernels().blend)(dst, src);
}

/* Per-channel multiply of src into dst. */
pub fn multiply(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    debug_assert_eq!(dst.len() % 4, 0);
    (kernels().multiply)(dst, src);
}

/* floor(x / 255), exact for x <= 65790. Operands here peak at 65152. */
#[inline]
fn div255(x: u32) -> u32 {
    (x * 0x8081) >> 23
}

fn blend_plain(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
        let alpha = u32::from(s[3]);
        let nalpha = 255 - alpha;
        d[0] = div255(u32::from(s[0]) * alpha + u32::from(d[0]) * nalpha + 127) as u8;
        d[1] = div255(u32::from(s[1]) * alpha + u32::from(d[1]) * nalpha + 127) as u8;
        d[2] = div255(u32::from(s[2]) * alpha + u32::from(d[2]) * nalpha + 127) as u8;
        d[3] = (alpha + div255(u32::from(d[3]) * nalpha + 127)) as u8;
    }
}

fn multiply_plain(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
        for c in 0..4 {
            d[c] = div255(u32::from(d[c]) * u32::from(s[c]) + 127) as u8;
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn blend_sse2_entry(dst: &mut [u8], src: &[u8]) {
    let whole = dst.len() / 16 * 16;
    /* SAFETY: entry is only installed after runtime SSE2 detection. */
    unsafe { blend_sse2(&mut dst[..whole], &src[..whole]) };
    blend_plain(&mut dst[whole..], &src[whole..]);
}

#[cfg(target_arch = "x86_64")]
fn multiply_sse2_entry(dst: &mut [u8], src: &[u8]) {
    let whole = dst.len() / 16 * 16;
    /* SAFETY: as above. */
    unsafe { multiply_sse2(&mut dst[..whole], &src[..whole]) };
    multiply_plain(&mut dst[whole..], &src[whole..]);
}

#[cfg(target_arch = "x86_64")]
fn blend_avx2_entry(dst: &mut [u8], src: &[u8]) {
    let whole = dst.len() / 32 * 32;
    /* SAFETY: entry is only installed after runtime AVX2 detection. */
    unsafe { blend_avx2(&mut dst[..whole], &src[..whole]) };
    blend_plain(&mut dst[whole..], &src[whole..]);
}

#[cfg(target_arch = "x86_64")]
fn multiply_avx2_entry(dst: &mut [u8], src: &[u8]) {
    let whole = dst.len() / 32 * 32;
    /* SAFETY: as above. */
    unsafe { multiply_avx2(&mut dst[..whole], &src[..whole]) };
    multiply_plain(&mut dst[whole..], &src[whole..]);
}

/* Blend of one unpacked half: two pixels as eight u16 lanes. */
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn blend_half_sse2(
    s: std::arch::x86_64::__m128i,
    d: std::arch::x86_64::__m128i,
) -> std::arch::x86_64::__m128i {
    use std::arch::x86_64::*;

    let x7f = _mm_set1_epi16(127);
    let xff = _mm_set1_epi16(255);
    let magic = _mm_set1_epi16(0x8081u16 as i16);
    /* selects the alpha lane of each pixel */
    let amask = _mm_set_epi16(-1, 0, 0, 0, -1, 0, 0, 0);

    /* broadcast each pixel's alpha over its four lanes */
    let alpha = _mm_shufflehi_epi16::<0xFF>(_mm_shufflelo_epi16::<0xFF>(s));
    let nalpha = _mm_sub_epi16(xff, alpha);
    let x = _mm_add_epi16(
        _mm_add_epi16(_mm_mullo_epi16(s, alpha), _mm_mullo_epi16(d, nalpha)),
        x7f,
    );
    let rgb = _mm_srli_epi16::<7>(_mm_mulhi_epu16(x, magic));
    let y = _mm_add_epi16(_mm_mullo_epi16(d, nalpha), x7f);
    let a = _mm_add_epi16(s, _mm_srli_epi16::<7>(_mm_mulhi_epu16(y, magic)));
    _mm_or_si128(_mm_andnot_si128(amask, rgb), _mm_and_si128(amask, a))
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn blend_sse2(dst: &mut [u8], src: &[u8]) {
    use std::arch::x86_64::*;

    let zero = _mm_setzero_si128();
    for (d, s) in dst.chunks_exact_mut(16).zip(src.chunks_exact(16)) {
        let sv = _mm_loadu_si128(s.as_ptr() as *const __m128i);
        let dv = _mm_loadu_si128(d.as_ptr() as *const __m128i);
        let lo = blend_half_sse2(_mm_unpacklo_epi8(sv, zero), _mm_unpacklo_epi8(dv, zero));
        let hi = blend_half_sse2(_mm_unpackhi_epi8(sv, zero), _mm_unpackhi_epi8(dv, zero));
        _mm_storeu_si128(d.as_mut_ptr() as *mut __m128i, _mm_packus_epi16(lo, hi));
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn multiply_sse2(dst: &mut [u8], src: &[u8]) {
    use std::arch::x86_64::*;

    let x7f = _mm_set1_epi16(127);
    let magic = _mm_set1_epi16(0x8081u16 as i16);
    let zero = _mm_setzero_si128();

    for (d, s) in dst.chunks_exact_mut(16).zip(src.chunks_exact(16)) {
        let sv = _mm_loadu_si128(s.as_ptr() as *const __m128i);
        let dv = _mm_loadu_si128(d.as_ptr() as *const __m128i);
        let xlo = _mm_add_epi16(
            _mm_mullo_epi16(_mm_unpacklo_epi8(sv, zero), _mm_unpacklo_epi8(dv, zero)),
            x7f,
        );
        let xhi = _mm_add_epi16(
            _mm_mullo_epi16(_mm_unpackhi_epi8(sv, zero), _mm_unpackhi_epi8(dv, zero)),
            x7f,
        );
        let lo = _mm_srli_epi16::<7>(_mm_mulhi_epu16(xlo, magic));
        let hi = _mm_srli_epi16::<7>(_mm_mulhi_epu16(xhi, magic));
        _mm_storeu_si128(d.as_mut_ptr() as *mut __m128i, _mm_packus_epi16(lo, hi));
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn blend_half_avx2(
    s: std::arch::x86_64::__m256i,
    d: std::arch::x86_64::__m256i,
) -> std::arch::x86_64::__m256i {
    use std::arch::x86_64::*;

    let x7f = _mm256_set1_epi16(127);
    let xff = _mm256_set1_epi16(255);
    let magic = _mm256_set1_epi16(0x8081u16 as i16);
    let amask = _mm256_set_epi16(-1, 0, 0, 0, -1, 0, 0, 0, -1, 0, 0, 0, -1, 0, 0, 0);

    let alpha = _mm256_shufflehi_epi16::<0xFF>(_mm256_shufflelo_epi16::<0xFF>(s));
    let nalpha = _mm256_sub_epi16(xff, alpha);
    let x = _mm256_add_epi16(
        _mm256_add_epi16(_mm256_mullo_epi16(s, alpha), _mm256_mullo_epi16(d, nalpha)),
        x7f,
    );
    let rgb = _mm256_srli_epi16::<7>(_mm256_mulhi_epu16(x, magic));
    let y = _mm256_add_epi16(_mm256_mullo_epi16(d, nalpha), x7f);
    let a = _mm256_add_epi16(s, _mm256_srli_epi16::<7>(_mm256_mulhi_epu16(y, magic)));
    _mm256_or_si256(_mm256_andnot_si256(amask, rgb), _mm256_and_si256(amask, a))
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn blend_avx2(dst: &mut [u8], src: &[u8]) {
    use std::arch::x86_64::*;

    let zero = _mm256_setzero_si256();
    for (d, s) in dst.chunks_exact_mut(32).zip(src.chunks_exact(32)) {
        let sv = _mm256_loadu_si256(s.as_ptr() as *const __m256i);
        let dv = _mm256_loadu_si256(d.as_ptr() as *const __m256i);
        /* unpack/pack are both 128-bit-lane local, so the shuffle cancels */
        let lo = blend_half_avx2(_mm256_unpacklo_epi8(sv, zero), _mm256_unpacklo_epi8(dv, zero));
        let hi = blend_half_avx2(_mm256_unpackhi_epi8(sv, zero), _mm256_unpackhi_epi8(dv, zero));
        _mm256_storeu_si256(d.as_mut_ptr() as *mut __m256i, _mm256_packus_epi16(lo, hi));
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn multiply_avx2(dst: &mut [u8], src: &[u8]) {
    use std::arch::x86_64::*;

    let x7f = _mm256_set1_epi16(127);
    let magic = _mm256_set1_epi16(0x8081u16 as i16);
    let zero = _mm256_setzero_si256();

    for (d, s) in dst.chunks_exact_mut(32).zip(src.chunks_exact(32)) {
        let sv = _mm256_loadu_si256(s.as_ptr() as *const __m256i);
        let dv = _mm256_loadu_si256(d.as_ptr() as *const __m256i);
        let xlo = _mm256_add_epi16(
            _mm256_mullo_epi16(_mm256_unpacklo_epi8(sv, zero), _mm256_unpacklo_epi8(dv, zero)),
            x7f,
        );
        let xhi = _mm256_add_epi16(
            _mm256_mullo_epi16(_mm256_unpackhi_epi8(sv, zero), _mm256_unpackhi_epi8(dv, zero)),
            x7f,
        );
        let lo = _mm256_srli_epi16::<7>(_mm256_mulhi_epu16(xlo, magic));
        let hi = _mm256_srli_epi16::<7>(_mm256_mulhi_epu16(xhi, magic));
        _mm256_storeu_si256(d.as_mut_ptr() as *mut __m256i, _mm256_packus_epi16(lo, hi));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel_pattern(len: usize, seed: u32) -> Vec<u8> {
        /* deterministic pseudo-random bytes covering all channel values */
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn blend_opaque_source_overwrites() {
        let mut dst = pixel_pattern(64, 1);
        let mut src = pixel_pattern(64, 2);
        for px in src.chunks_exact_mut(4) {
            px[3] = 255;
        }
        blend_plain(&mut dst, &src);
        assert_eq!(dst, src);
    }

    #[test]
    fn blend_transparent_source_is_noop() {
        let mut dst = pixel_pattern(64, 3);
        let expected = dst.clone();
        let mut src = pixel_pattern(64, 4);
        for px in src.chunks_exact_mut(4) {
            px[3] = 0;
        }
        blend_plain(&mut dst, &src);
        assert_eq!(dst, expected);
    }

    #[test]
    fn blend_half_alpha_over_black() {
        let mut dst = vec![0, 0, 0, 255];
        let src = vec![255, 255, 255, 127];
        blend_plain(&mut dst, &src);
        assert!(dst[0] >= 126 && dst[0] <= 128, "got {}", dst[0]);
        assert_eq!(dst[0], dst[1]);
        assert_eq!(dst[1], dst[2]);
        assert_eq!(dst[3], 255);
    }

    #[test]
    fn multiply_by_white_is_noop() {
        let mut dst = pixel_pattern(64, 5);
        let expected = dst.clone();
        let src = vec![255u8; 64];
        multiply_plain(&mut dst, &src);
        assert_eq!(dst, expected);
    }

    #[test]
    fn multiply_by_black_clears() {
        let mut dst = pixel_pattern(64, 6);
        let src = vec![0u8; 64];
        multiply_plain(&mut dst, &src);
        assert!(dst.iter().all(|&b| b == 0));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn sse2_matches_plain() {
        if !is_x86_feature_detected!("sse2") {
            return;
        }
        /* 37 pixels: exercises the vector body and the tail path */
        let src = pixel_pattern(37 * 4, 7);
        let base = pixel_pattern(37 * 4, 8);

        let mut expect = base.clone();
        blend_plain(&mut expect, &src);
        let mut got = base.clone();
        blend_sse2_entry(&mut got, &src);
        assert_eq!(got, expect);

        let mut expect = base.clone();
        multiply_plain(&mut expect, &src);
        let mut got = base.clone();
        multiply_sse2_entry(&mut got, &src);
        assert_eq!(got, expect);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn avx2_matches_plain() {
        if !is_x86_feature_detected!("avx2") {
            return;
        }
        let src = pixel_pattern(61 * 4, 9);
        let base = pixel_pattern(61 * 4, 10);

        let mut expect = base.clone();
        blend_plain(&mut expect, &src);
        let mut got = base.clone();
        blend_avx2_entry(&mut got, &src);
        assert_eq!(got, expect);

        let mut expect = base.clone();
        multiply_plain(&mut expect, &src);
        let mut got = base.clone();
        multiply_avx2_entry(&mut got, &src);
        assert_eq!(got, expect);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn all_alpha_values_match_across_kernels() {
        if !is_x86_feature_detected!("sse2") {
            return;
        }
        /* sweep every (alpha, channel) pair through both kernels */
        for alpha in 0..=255u8 {
            let src: Vec<u8> = (0..=255u8).flat_map(|c| [c, c, c, alpha]).collect();
            let base: Vec<u8> = (0..=255u8).flat_map(|c| [255 - c, 128, c, 200]).collect();
            let mut expect = base.clone();
            blend_plain(&mut expect, &src);
            let mut got = base.clone();
            blend_sse2_entry(&mut got, &src);
            assert_eq!(got, expect, "alpha {alpha}");
        }
    }
}
