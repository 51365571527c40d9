use kms_sys::{
    fb_var_screeninfo, fourcc_name, DRM_FORMAT_ABGR8888, DRM_FORMAT_ARGB8888, DRM_FORMAT_XRGB8888,
};

use super::CaptureError;

/// Only depth either capture path accepts.
pub const SUPPORTED_BPP: u32 = 32;

/// Canonical bytes per pixel of the snapshot buffer.
pub const CANONICAL_BYTES_PER_PIXEL: u32 = SUPPORTED_BPP / 8;

/// Canonical screen geometry and color-channel layout.
///
/// `*_max` carry the channel depth in bits, `*_shift` the bit offset of the channel inside
/// a 32-bit pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FormatDescriptor {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u8,
    pub red_shift: u8,
    pub red_max: u16,
    pub green_shift: u8,
    pub green_max: u16,
    pub blue_shift: u8,
    pub blue_max: u16,
    /// Bytes of one canonical frame; kept wide so maximum kernel resolutions fit
    pub byte_size: u64,
}

/// Channel placement shared by every supported 32-bit layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout {
    pub red: (u8, u16),
    pub green: (u8, u16),
    pub blue: (u8, u16),
}

impl ChannelLayout {
    /// Packed 0xAARRGGBB / 0xXXRRGGBB.
    pub const RGB: Self = Self { red: (16, 8), green: (8, 8), blue: (0, 8) };
    /// Packed 0xAABBGGRR.
    pub const BGR: Self = Self { red: (0, 8), green: (8, 8), blue: (16, 8) };

    /// Closed FourCC table for the modesetting path. Anything outside it is refused rather
    /// than guessed.
    pub fn from_fourcc(fourcc: u32) -> Result<Self, CaptureError> {
        match fourcc {
            DRM_FORMAT_XRGB8888 | DRM_FORMAT_ARGB8888 => Ok(Self::RGB),
            DRM_FORMAT_ABGR8888 => Ok(Self::BGR),
            other => Err(CaptureError::UnsupportedPixelFormat {
                fourcc: other,
                name: fourcc_name(other),
            }),
        }
    }
}

impl FormatDescriptor {
    /// Build a 32 bpp descriptor from a resolution and channel placement.
    pub fn new(width: u32, height: u32, layout: ChannelLayout) -> Self {
        Self {
            width,
            height,
            bits_per_pixel: SUPPORTED_BPP as u8,
            red_shift: layout.red.0,
            red_max: layout.red.1,
            green_shift: layout.green.0,
            green_max: layout.green.1,
            blue_shift: layout.blue.0,
            blue_max: layout.blue.1,
            byte_size: frame_bytes(width, height, SUPPORTED_BPP),
        }
    }

    /// Descriptor for a modesetting buffer with the given FourCC.
    pub fn from_fourcc(width: u32, height: u32, fourcc: u32) -> Result<Self, CaptureError> {
        Ok(Self::new(width, height, ChannelLayout::from_fourcc(fourcc)?))
    }

    /// Descriptor from the legacy framebuffer's self-described channel bitfields.
    pub fn from_var_info(info: &fb_var_screeninfo) -> Result<Self, CaptureError> {
        if info.bits_per_pixel != SUPPORTED_BPP {
            return Err(CaptureError::UnsupportedDepth {
                bits_per_pixel: info.bits_per_pixel,
            });
        }

        for (channel, field) in [("red", &info.red), ("green", &info.green), ("blue", &info.blue)] {
            if field.length == 0 || u64::from(field.offset) + u64::from(field.length) > u64::from(SUPPORTED_BPP) {
                return Err(CaptureError::BadChannelLayout {
                    channel,
                    offset: field.offset,
                    length: field.length,
                });
            }
        }

        Ok(Self {
            width: info.xres,
            height: info.yres,
            bits_per_pixel: info.bits_per_pixel as u8,
            red_shift: info.red.offset as u8,
            red_max: info.red.length as u16,
            green_shift: info.green.offset as u8,
            green_max: info.green.length as u16,
            blue_shift: info.blue.offset as u8,
            blue_max: info.blue.length as u16,
            byte_size: frame_bytes(info.xres, info.yres, info.bits_per_pixel),
        })
    }

    /// Number of canonical pixels in one frame.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn same_resolution(&self, other: &FormatDescriptor) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// Expand one canonical pixel to 8-bit RGB using this layout.
    pub fn to_rgb8(&self, pixel: u32) -> [u8; 3] {
        [
            scale_channel(pixel, self.red_shift, self.red_max),
            scale_channel(pixel, self.green_shift, self.green_max),
            scale_channel(pixel, self.blue_shift, self.blue_max),
        ]
    }
}

fn frame_bytes(width: u32, height: u32, bits_per_pixel: u32) -> u64 {
    u64::from(width) * u64::from(height) * u64::from(bits_per_pixel / 8)
}

fn scale_channel(pixel: u32, shift: u8, bits: u16) -> u8 {
    if bits == 0 || bits > 16 {
        return 0;
    }
    let max = (1u32 << bits) - 1;
    let value = pixel.checked_shr(u32::from(shift)).unwrap_or(0) & max;
    ((value * 255 + max / 2) / max) as u8
}

/// Native layout of one captured frame, as last read from the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScreenGeometry {
    pub width: u32,
    pub height: u32,
    /// Bytes per scanline in the mapped buffer; may exceed `width * 4`.
    pub stride: u32,
}

impl ScreenGeometry {
    /// Bytes a mapping must cover to hold the whole visible frame.
    pub fn mapped_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kms_sys::{fb_bitfield, DRM_FORMAT_RGB565};

    #[test]
    fn test_xrgb_and_argb_layout() {
        for fourcc in [DRM_FORMAT_XRGB8888, DRM_FORMAT_ARGB8888] {
            let f = FormatDescriptor::from_fourcc(1920, 1080, fourcc).unwrap();
            assert_eq!(f.bits_per_pixel, 32);
            assert_eq!((f.red_shift, f.green_shift, f.blue_shift), (16, 8, 0));
            assert_eq!((f.red_max, f.green_max, f.blue_max), (8, 8, 8));
            assert_eq!(f.byte_size, 1920 * 1080 * 4);
        }
    }

    #[test]
    fn test_abgr_layout() {
        let f = FormatDescriptor::from_fourcc(800, 600, DRM_FORMAT_ABGR8888).unwrap();
        assert_eq!((f.red_shift, f.green_shift, f.blue_shift), (0, 8, 16));
        assert_eq!((f.red_max, f.green_max, f.blue_max), (8, 8, 8));
    }

    #[test]
    fn test_unknown_fourcc_is_refused() {
        let err = FormatDescriptor::from_fourcc(800, 600, DRM_FORMAT_RGB565).unwrap_err();
        match err {
            CaptureError::UnsupportedPixelFormat { fourcc, ref name } => {
                assert_eq!(fourcc, DRM_FORMAT_RGB565);
                assert_eq!(name, "RG16");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    fn var_info(bpp: u32) -> fb_var_screeninfo {
        fb_var_screeninfo {
            xres: 1280,
            yres: 720,
            xres_virtual: 1280,
            yres_virtual: 1440,
            bits_per_pixel: bpp,
            red: fb_bitfield { offset: 0, length: 8, msb_right: 0 },
            green: fb_bitfield { offset: 8, length: 8, msb_right: 0 },
            blue: fb_bitfield { offset: 16, length: 8, msb_right: 0 },
            ..Default::default()
        }
    }

    #[test]
    fn test_var_info_is_self_describing() {
        let f = FormatDescriptor::from_var_info(&var_info(32)).unwrap();
        assert_eq!((f.width, f.height), (1280, 720));
        assert_eq!((f.red_shift, f.green_shift, f.blue_shift), (0, 8, 16));
        assert_eq!(f.byte_size, 1280 * 720 * 4);
    }

    #[test]
    fn test_var_info_rejects_16bpp() {
        let err = FormatDescriptor::from_var_info(&var_info(16)).unwrap_err();
        assert!(matches!(err, CaptureError::UnsupportedDepth { bits_per_pixel: 16 }));
    }

    #[test]
    fn test_byte_size_at_maximum_resolution() {
        let f = FormatDescriptor::from_fourcc(16384, 16384, DRM_FORMAT_XRGB8888).unwrap();
        assert_eq!(f.byte_size, 16384 * 16384 * 4);
        let f = FormatDescriptor::new(u32::from(u16::MAX), u32::from(u16::MAX), ChannelLayout::RGB);
        assert_eq!(f.byte_size, 65535 * 65535 * 4);

        let mut info = var_info(32);
        info.xres = 16384;
        info.yres = 16384;
        assert_eq!(FormatDescriptor::from_var_info(&info).unwrap().byte_size, 1 << 30);
    }

    #[test]
    fn test_var_info_rejects_channels_outside_the_pixel() {
        let mut info = var_info(32);
        info.green.offset = 32;
        let err = FormatDescriptor::from_var_info(&info).unwrap_err();
        assert!(matches!(err, CaptureError::BadChannelLayout { channel: "green", offset: 32, .. }));

        let mut info = var_info(32);
        info.blue = fb_bitfield { offset: 28, length: 8, msb_right: 0 };
        assert!(FormatDescriptor::from_var_info(&info).is_err());

        let mut info = var_info(32);
        info.red.length = 0;
        assert!(FormatDescriptor::from_var_info(&info).is_err());
    }

    #[test]
    fn test_to_rgb8_ignores_out_of_range_shift() {
        let mut f = FormatDescriptor::new(1, 1, ChannelLayout::RGB);
        f.red_shift = 40;
        assert_eq!(f.to_rgb8(0xffff_ffff), [0x00, 0xff, 0xff]);
    }

    #[test]
    fn test_to_rgb8() {
        let rgb = FormatDescriptor::new(1, 1, ChannelLayout::RGB);
        assert_eq!(rgb.to_rgb8(0x00ff_8000), [0xff, 0x80, 0x00]);
        let bgr = FormatDescriptor::new(1, 1, ChannelLayout::BGR);
        assert_eq!(bgr.to_rgb8(0x00ff_8000), [0x00, 0x80, 0xff]);
    }
}
