//! Raw termios serial handle for the respiration belt, 115200 8N1.

use libc::{c_int, speed_t, termios};
use std::{ffi::CString, io, mem, os::unix::ffi::OsStrExt, path::Path};

const BAUD_RATE: speed_t = libc::B115200;

fn cvt(res: c_int) -> io::Result<c_int> {
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res)
    }
}

/// Bi-directional serial handle. Reads time out after 100 ms so a stop flag
/// never waits on a silent line.
pub struct SerialPort {
    fd: c_int,
}

impl SerialPort {
    /// Opens a serial interface in raw mode
    pub fn open<T: AsRef<Path>>(path: T) -> io::Result<Self> {
        let path = CString::new(path.as_ref().as_os_str().as_bytes())?;
        // Safety: path is a valid NUL-terminated string
        let fd = cvt(unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_RDWR | libc::O_NOCTTY | libc::O_CLOEXEC,
            )
        })?;
        // Construct first so the fd is closed if configuration fails
        let port = Self { fd };
        port.configure()?;
        Ok(port)
    }

    fn configure(&self) -> io::Result<()> {
        // Safety: termios is plain-old-data and the fd is open
        unsafe {
            let mut termios: termios = mem::zeroed();
            cvt(libc::tcgetattr(self.fd, &mut termios))?;
            termios.c_cflag &= !(libc::PARENB
                | libc::PARODD
                | libc::CSIZE
                | libc::CRTSCTS
                | libc::CSTOPB
                | libc::CBAUD);
            termios.c_cflag |= libc::CLOCAL | libc::CREAD | libc::CS8 | BAUD_RATE;
            termios.c_lflag &= !(libc::ICANON
                | libc::ECHO
                | libc::ECHOE
                | libc::ECHOK
                | libc::ECHONL
                | libc::ISIG
                | libc::IEXTEN);
            termios.c_oflag &= !(libc::OPOST | libc::ONLCR | libc::OCRNL);
            termios.c_iflag &= !(libc::INLCR
                | libc::IGNCR
                | libc::ICRNL
                | libc::IGNBRK
                | libc::INPCK
                | libc::ISTRIP
                | libc::IXON
                | libc::IXOFF
                | libc::IXANY
                | libc::PARMRK);
            termios.c_ispeed = BAUD_RATE;
            termios.c_ospeed = BAUD_RATE;
            // Deciseconds; VMIN=0/VTIME=1 bounds every read at 100 ms
            termios.c_cc[libc::VMIN] = 0;
            termios.c_cc[libc::VTIME] = 1;
            cvt(libc::tcsetattr(self.fd, libc::TCSANOW, &termios))?;
            cvt(libc::tcflush(self.fd, libc::TCIFLUSH))?;
        }
        Ok(())
    }
}

impl io::Read for SerialPort {
    #[allow(clippy::cast_sign_loss)]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Safety: buf is valid for writes of its own length
        let read = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if read < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(read as _)
    }
}

impl io::Write for SerialPort {
    #[allow(clippy::cast_sign_loss)]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Safety: buf is valid for reads of its own length
        let written = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
        if written < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(written as _)
    }

    fn flush(&mut self) -> io::Result<()> {
        // Safety: fd is open
        cvt(unsafe { libc::tcdrain(self.fd) })?;
        Ok(())
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        // Safety: closing our own fd exactly once
        if unsafe { libc::close(self.fd) } != 0 {
            tracing::error!(
                "Couldn't close serial interface descriptor: {}",
                io::Error::last_os_error()
            );
        }
    }
}
