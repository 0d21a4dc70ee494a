use log::{Level, Log, Metadata, Record};

static LOGGER: Logger = Logger {
    crate_name: env!("CARGO_PKG_NAME"),
};

pub fn setup_logger(max_level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(max_level);
    Ok(())
}

struct Logger {
    crate_name: &'static str,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        // Dependencies only get to report problems.
        metadata.target().starts_with(self.crate_name) || metadata.level() <= Level::Warn
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        println!(
            "{} {} -- {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Formats cookies, SPIs and key material.
pub fn fmt_slice_hex(data: &[u8]) -> impl std::fmt::Display + '_ {
    struct HexSlice<'a>(&'a [u8]);
    impl std::fmt::Display for HexSlice<'_> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            for b in self.0.iter() {
                write!(f, "{b:02x}")?;
            }
            Ok(())
        }
    }
    HexSlice(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_formatting() {
        assert_eq!(fmt_slice_hex(&[0x00, 0x1f, 0xab]).to_string(), "001fab");
        assert_eq!(fmt_slice_hex(&[]).to_string(), "");
    }
}
