//! Shared test data.

/// Three red bars closing under the EMA, a reversal bar back above it, then a
/// rally through the default 20-tick target.
pub const PULLBACK_CSV: &str = "date_time,open,high,low,close,volume\n\
    2024-01-02 09:30:00,100,100.5,99.5,100,10\n\
    2024-01-02 09:31:00,100,100.25,98.75,99,10\n\
    2024-01-02 09:32:00,99,99.25,97.75,98,10\n\
    2024-01-02 09:33:00,98,98.25,96.75,97,10\n\
    2024-01-02 09:34:00,97,101.25,96.75,101,10\n\
    2024-01-02 09:35:00,101,103,100.5,102.5,10\n\
    2024-01-02 09:36:00,102.5,106.5,102,106,10\n";
