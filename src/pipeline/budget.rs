//! Per-source truncation budgets
//!
//! A shared character budget is split evenly across sources and clamped so no
//! source gets too little context to be useful or too much to fit.

/// `clamp(total / count, min, max)`; zero sources get the maximum
pub fn allocate(total: usize, count: usize, min: usize, max: usize) -> usize {
    let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
    if count == 0 {
        return hi;
    }
    (total / count).clamp(lo, hi)
}

/// Window of `budget` chars of `text` roughly centred on `[start, end)` (char offsets)
///
/// The span itself is always included, even when it alone exceeds the budget.
pub fn context_window(text: &str, start: usize, end: usize, budget: usize) -> String {
    let len = text.chars().count();
    let start = start.min(len);
    let end = end.clamp(start, len);

    let spare = budget.saturating_sub(end - start);
    let before = (spare / 2).min(start);
    let after = (spare - before).min(len - end);
    // Give unused trailing room back to the leading side
    let before = (spare - after).min(start);

    text.chars()
        .skip(start - before)
        .take(before + (end - start) + after)
        .collect()
}
