//! Allocation-free diagnostics written straight to `stderr`.
use core::fmt;

static mut MUTEX: libc::pthread_mutex_t = libc::PTHREAD_MUTEX_INITIALIZER;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Warn,
    Error,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Self::Warn => "heapguard: ",
            Self::Error => "heapguard: error: ",
        }
    }
}

pub fn log(level: Level, args: fmt::Arguments<'_>) {
    unsafe { libc::pthread_mutex_lock(core::ptr::addr_of_mut!(MUTEX)) };
    let _ = fmt::Write::write_str(&mut Stderr, level.tag());
    let _ = fmt::Write::write_fmt(&mut Stderr, args);
    let _ = fmt::Write::write_str(&mut Stderr, "\n");
    unsafe { libc::pthread_mutex_unlock(core::ptr::addr_of_mut!(MUTEX)) };
}

struct Stderr;

impl fmt::Write for Stderr {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let stderr = 2;
        let mut s = s.as_bytes();
        while !s.is_empty() {
            let written = unsafe { libc::write(stderr, s.as_ptr().cast(), s.len()) };
            if written < 0 {
                break;
            }
            s = &s[written as usize..];
        }
        Ok(())
    }
}

macro_rules! warn {
    ($($tt:tt)*) => {
        crate::logger::log(crate::logger::Level::Warn, format_args!($($tt)*))
    }
}

macro_rules! error {
    ($($tt:tt)*) => {
        crate::logger::log(crate::logger::Level::Error, format_args!($($tt)*))
    }
}
