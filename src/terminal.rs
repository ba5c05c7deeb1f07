//! Terminal queries for the progress display.

/// Whether stdout is a terminal we can overprint on.
pub fn use_fancy() -> bool {
    if std::env::var_os("TERM").map_or(false, |t| t == "dumb") {
        return false;
    }
    unsafe { libc::isatty(/* stdout */ 1) == 1 }
}

pub fn get_cols() -> Option<usize> {
    unsafe {
        let mut winsize = std::mem::zeroed::<libc::winsize>();
        if libc::ioctl(1, libc::TIOCGWINSZ, &mut winsize) < 0 {
            return None;
        }
        if winsize.ws_col < 10 {
            // Too narrow to lay anything out; fall back to the default.
            return None;
        }
        Some(winsize.ws_col as usize)
    }
}
