/// Pack 8-bit channels into RGB565 by truncation.
#[inline(always)]
pub(crate) const fn pack_rgb565(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 & 0xF8) << 8) | ((g as u16 & 0xFC) << 3) | (b as u16 >> 3)
}

#[inline(always)]
fn bgra_word_to_rgb565(pixel: u32) -> u16 {
    let [b, g, r, _] = pixel.to_le_bytes();
    pack_rgb565(r, g, b)
}

#[inline(always)]
fn rgba_word_to_rgb565(pixel: u32) -> u16 {
    let [r, g, b, _] = pixel.to_le_bytes();
    pack_rgb565(r, g, b)
}

#[inline(always)]
unsafe fn convert_words_unchecked(
    src: *const u8,
    dst: *mut u16,
    pixel_count: usize,
    pack: fn(u32) -> u16,
) {
    let mut src_px = src as *const u32;
    let mut dst_px = dst;
    let mut remaining = pixel_count;

    while remaining >= 4 {
        unsafe {
            let p0 = std::ptr::read_unaligned(src_px);
            let p1 = std::ptr::read_unaligned(src_px.add(1));
            let p2 = std::ptr::read_unaligned(src_px.add(2));
            let p3 = std::ptr::read_unaligned(src_px.add(3));

            std::ptr::write_unaligned(dst_px, pack(p0));
            std::ptr::write_unaligned(dst_px.add(1), pack(p1));
            std::ptr::write_unaligned(dst_px.add(2), pack(p2));
            std::ptr::write_unaligned(dst_px.add(3), pack(p3));
        }

        src_px = unsafe { src_px.add(4) };
        dst_px = unsafe { dst_px.add(4) };
        remaining -= 4;
    }

    while remaining != 0 {
        unsafe {
            let pixel = std::ptr::read_unaligned(src_px);
            std::ptr::write_unaligned(dst_px, pack(pixel));
        }

        src_px = unsafe { src_px.add(1) };
        dst_px = unsafe { dst_px.add(1) };
        remaining -= 1;
    }
}

/// # Safety
/// `src` must be readable for `pixel_count * 4` bytes and `dst` writable
/// for `pixel_count` samples.
pub(crate) unsafe fn convert_bgra_to_rgb565_unchecked(
    src: *const u8,
    dst: *mut u16,
    pixel_count: usize,
) {
    unsafe { convert_words_unchecked(src, dst, pixel_count, bgra_word_to_rgb565) }
}

/// # Safety
/// Same as [`convert_bgra_to_rgb565_unchecked`].
pub(crate) unsafe fn convert_rgba_to_rgb565_unchecked(
    src: *const u8,
    dst: *mut u16,
    pixel_count: usize,
) {
    unsafe { convert_words_unchecked(src, dst, pixel_count, rgba_word_to_rgb565) }
}

/// RGB565 as two big-endian bytes, the order display controllers clock in.
#[inline]
pub(crate) fn write_rgb565_be(src: &[u16], dst: &mut [u8]) {
    for (pixel, out) in src.iter().zip(dst.chunks_exact_mut(2)) {
        out.copy_from_slice(&pixel.to_be_bytes());
    }
}

/// RGB565 widened to `R6X2 G6X2 B6X2`: six significant bits per channel
/// in the top of each byte.
#[inline]
pub(crate) fn write_rgb666(src: &[u16], dst: &mut [u8]) {
    for (&pixel, out) in src.iter().zip(dst.chunks_exact_mut(3)) {
        let r5 = (pixel >> 11) as u8 & 0x1F;
        let g6 = (pixel >> 5) as u8 & 0x3F;
        let b5 = pixel as u8 & 0x1F;
        let r6 = (r5 << 1) | (r5 >> 4);
        let b6 = (b5 << 1) | (b5 >> 4);
        out[0] = r6 << 2;
        out[1] = g6 << 2;
        out[2] = b6 << 2;
    }
}
