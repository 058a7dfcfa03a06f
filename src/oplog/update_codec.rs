use bytes::Buf;
use bytes::BufMut;

use crate::config_models::RowOpLogType;
use crate::config_models::TableInfo;

/// Wire encoding of a single update value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCodec {
    F32,

    /// IEEE 754 binary16.
    F16,
}

impl UpdateCodec {
    pub fn for_table(info: &TableInfo) -> Self {
        match info.row_oplog_type {
            RowOpLogType::Float16Dense => UpdateCodec::F16,
            _ => UpdateCodec::F32,
        }
    }

    pub fn update_size(&self) -> usize {
        match self {
            UpdateCodec::F32 => 4,
            UpdateCodec::F16 => 2,
        }
    }

    pub fn put(&self, buf: &mut impl BufMut, value: f32) {
        match self {
            UpdateCodec::F32 => buf.put_f32_le(value),
            UpdateCodec::F16 => buf.put_u16_le(f32_to_f16(value)),
        }
    }

    pub fn get(&self, buf: &mut impl Buf) -> f32 {
        match self {
            UpdateCodec::F32 => buf.get_f32_le(),
            UpdateCodec::F16 => f16_to_f32(buf.get_u16_le()),
        }
    }
}

/// Round to nearest, ties to even. Overflow saturates to infinity.
pub fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32;
    let mant = bits & 0x7f_ffff;

    if exp == 0xff {
        let nan_bit = if mant != 0 { 0x200 } else { 0 };
        return sign | 0x7c00 | nan_bit;
    }

    let half_exp = exp - 127 + 15;
    if half_exp >= 0x1f {
        return sign | 0x7c00;
    }

    if half_exp <= 0 {
        if half_exp < -10 {
            return sign;
        }
        let full_mant = mant | 0x80_0000;
        let shift = (14 - half_exp) as u32;
        let half_mant = full_mant >> shift;
        let round_bit = 1u32 << (shift - 1);
        let round_up = full_mant & round_bit != 0 && full_mant & (3 * round_bit - 1) != 0;
        return sign | (half_mant + u32::from(round_up)) as u16;
    }

    let half = ((half_exp as u32) << 10) | (mant >> 13);
    let round_bit = 0x1000u32;
    let round_up = mant & round_bit != 0 && mant & (3 * round_bit - 1) != 0;
    sign | (half + u32::from(round_up)) as u16
}

pub fn f16_to_f32(half: u16) -> f32 {
    let sign = u32::from(half & 0x8000) << 16;
    let exp = u32::from((half >> 10) & 0x1f);
    let mant = u32::from(half & 0x3ff);

    match exp {
        0 => {
            let magnitude = mant as f32 * (-24f32).exp2();
            if sign != 0 {
                -magnitude
            } else {
                magnitude
            }
        }
        0x1f => f32::from_bits(sign | 0x7f80_0000 | (mant << 13)),
        _ => f32::from_bits(sign | ((exp + 127 - 15) << 23) | (mant << 13)),
    }
}
