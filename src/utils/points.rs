//! 分值换算工具

/// 保留两位小数
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// 分数 → 百分比，满分为 0 时返回 0
pub fn points_to_perc(points: f64, max_points: f64) -> f64 {
    if max_points > 0.0 {
        round2(100.0 * points / max_points)
    } else {
        0.0
    }
}

/// 百分比 → 分数
pub fn perc_to_points(perc: f64, max_points: f64) -> f64 {
    round2(perc * max_points / 100.0)
}

/// 浮点比较（容差 1e-6）
pub fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

/// 在导出文件中显示分值：整数不带小数点
pub fn format_points(value: f64) -> String {
    let rounded = round2(value);
    if rounded.fract() == 0.0 {
        format!("{}", rounded as i64)
    } else {
        format!("{}", rounded)
    }
}
