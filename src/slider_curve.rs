//! Slider value-curve math
//!
//! Pure mappings between a normalized [0, 1] UI position and the script's
//! real slider value, for linear, logarithmic and power-law shapes. Each
//! forward function has an exact analytic inverse; degenerate parameter
//! combinations (collapsed range, anchor on an endpoint, non-positive log
//! bounds) fall back to the linear mapping instead of producing NaN or
//! infinities.

use crate::types::{Real, SliderShape};

/// Range and shape of one slider, as used by the mapping functions.
#[derive(Clone, Copy, Debug, Default)]
pub struct SliderCurve {
    pub def: Real,
    pub min: Real,
    pub max: Real,
    pub inc: Real,
    pub shape: SliderShape,
    pub modifier: Real,
}

fn sgn(value: Real) -> Real {
    if value >= 0.0 {
        1.0
    } else {
        -1.0
    }
}

pub fn from_normalized_linear(value: Real, curve: &SliderCurve) -> Real {
    value * (curve.max - curve.min) + curve.min
}

/// Signed-symmetric linear variant: a range straddling zero maps each half
/// independently so the midpoint lands exactly on zero.
pub fn from_normalized_linear_raw(value: Real, curve: &SliderCurve) -> Real {
    if curve.min.is_sign_negative() != curve.max.is_sign_negative()
        && curve.min != 0.0
        && curve.max != 0.0
    {
        if value > 0.5 {
            curve.max * (value + value - 1.0)
        } else {
            curve.min * (1.0 - value - value)
        }
    } else {
        value * (curve.max - curve.min) + curve.min
    }
}

pub fn to_normalized_linear(value: Real, curve: &SliderCurve) -> Real {
    let diff = curve.max - curve.min;
    if diff.abs() < 1e-12 {
        return curve.min;
    }
    (value - curve.min) / diff
}

pub fn to_normalized_linear_raw(value: Real, curve: &SliderCurve) -> Real {
    if curve.min.is_sign_negative() != curve.max.is_sign_negative()
        && curve.min != 0.0
        && curve.max != 0.0
    {
        if value.is_sign_negative() == curve.min.is_sign_negative() {
            0.5 * (1.0 - value / curve.min)
        } else {
            0.5 * (1.0 + value / curve.max)
        }
    } else {
        let diff = curve.max - curve.min;
        if diff.abs() < 1e-12 {
            return curve.min;
        }
        (value - curve.min) / diff
    }
}

pub fn from_normalized_log(value: Real, curve: &SliderCurve) -> Real {
    if curve.modifier == 0.0 {
        if curve.min <= 0.0001 || curve.max <= 0.0001 {
            from_normalized_linear(value, curve)
        } else {
            ((curve.max.ln() - curve.min.ln()) * value + curve.min.ln()).exp()
        }
    } else {
        if (curve.max - curve.min).abs() < 0.0000001 {
            return from_normalized_linear(value, curve);
        }
        if (curve.modifier - curve.min).abs() < 0.0000001 {
            return from_normalized_linear(value, curve);
        }

        let m = (curve.modifier - curve.min) / (curve.max - curve.min);
        let mut mm1 = (m - 1.0) / m;
        mm1 *= mm1;
        let prefactor = (curve.max - curve.min) / (mm1 - 1.0);

        prefactor * (mm1.abs().powf(value) - 1.0) + curve.min
    }
}

pub fn to_normalized_log(value: Real, curve: &SliderCurve) -> Real {
    if curve.modifier == 0.0 {
        if curve.min <= 0.0001 || curve.max <= 0.0001 {
            to_normalized_linear(value, curve)
        } else {
            (value.ln() - curve.min.ln()) / (curve.max.ln() - curve.min.ln())
        }
    } else {
        if (curve.max - curve.min).abs() < 0.0000001 {
            return to_normalized_linear(value, curve);
        }
        if (curve.modifier - curve.min).abs() < 0.0000001 {
            return to_normalized_linear(value, curve);
        }

        let m = (curve.modifier - curve.min) / (curve.max - curve.min);
        let mut mm1 = (m - 1.0) / m;
        mm1 *= mm1;
        let inv_prefactor = (mm1 - 1.0) / (curve.max - curve.min);

        ((value - curve.min) * inv_prefactor + 1.0).abs().ln() / mm1.abs().ln()
    }
}

/// Power-law mapping interpolating between the roots of the endpoints.
pub fn from_normalized_sqr(value: Real, curve: &SliderCurve) -> Real {
    let imaxi = sgn(curve.max) * curve.max.abs().powf(1.0 / curve.modifier);
    let imini = sgn(curve.min) * curve.min.abs().powf(1.0 / curve.modifier);
    let interp = value * (imaxi - imini) + imini;
    sgn(interp) * interp.abs().powf(curve.modifier)
}

pub fn to_normalized_sqr(value: Real, curve: &SliderCurve) -> Real {
    let inv_mod = 1.0 / curve.modifier;
    let imaxi = sgn(curve.max) * curve.max.abs().powf(inv_mod);
    let imini = sgn(curve.min) * curve.min.abs().powf(inv_mod);
    let interp = sgn(value) * value.abs().powf(inv_mod);
    (interp - imini) / (imaxi - imini)
}

/// Power-law variant that mirrors the positive and negative halves
/// independently around the midpoint when the range straddles zero.
pub fn from_normalized_sqr_raw(value: Real, curve: &SliderCurve) -> Real {
    if curve.min < 0.0 && curve.max > 0.0 {
        (2.0 * value - 1.0).abs().powf(curve.modifier)
            * if value > 0.5 { curve.max } else { curve.min }
    } else {
        let offset = (curve.min / curve.max).abs().powf(1.0 / curve.modifier);
        (value * (1.0 - offset) + offset).abs().powf(curve.modifier) * curve.max
    }
}

pub fn to_normalized_sqr_raw(value: Real, curve: &SliderCurve) -> Real {
    if curve.min < 0.0 && curve.max > 0.0 {
        let sign = if value >= 0.0 { 1.0 } else { -1.0 };
        let bound = if value >= 0.0 { curve.max } else { curve.min };
        0.5 * (sign * (value / bound).abs().powf(1.0 / curve.modifier) + 1.0)
    } else {
        let inv_mod = 1.0 / curve.modifier;
        let offset = (curve.min / curve.max).abs().powf(inv_mod);
        ((value / curve.max).abs().powf(inv_mod) - offset) / (1.0 - offset)
    }
}

/// Map a normalized [0, 1] position to the slider's real value.
pub fn normalized_to_value(normalized: Real, curve: &SliderCurve) -> Real {
    match curve.shape {
        SliderShape::Sqr => from_normalized_sqr(normalized, curve),
        SliderShape::Log => from_normalized_log(normalized, curve),
        SliderShape::Linear => from_normalized_linear(normalized, curve),
    }
}

/// Map a real slider value back to its normalized [0, 1] position.
pub fn value_to_normalized(value: Real, curve: &SliderCurve) -> Real {
    match curve.shape {
        SliderShape::Sqr => to_normalized_sqr(value, curve),
        SliderShape::Log => to_normalized_log(value, curve),
        SliderShape::Linear => to_normalized_linear(value, curve),
    }
}
