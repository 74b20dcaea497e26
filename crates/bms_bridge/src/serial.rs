//! Abertura da porta serial do dongle RS485.
//!
//! Em unix a porta é colocada em modo raw 8N1 com o baud rate configurado;
//! leituras bloqueiam até chegar pelo menos um byte.

use std::fs::File;
use std::io;

#[cfg(unix)]
pub fn open(device: &str, baudrate: u32) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    let speed = baud_constant(baudrate).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Baud rate não suportado: {baudrate}"),
        )
    })?;

    let file = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOCTTY)
        .open(device)?;
    let fd = file.as_raw_fd();

    // SAFETY: `fd` pertence a `file`, que vive durante todas as chamadas
    unsafe {
        let mut tio: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut tio) != 0 {
            return Err(io::Error::last_os_error());
        }
        libc::cfmakeraw(&mut tio);
        tio.c_cflag |= libc::CLOCAL | libc::CREAD;
        tio.c_cflag &= !(libc::CSTOPB | libc::PARENB);
        tio.c_cc[libc::VMIN] = 1;
        tio.c_cc[libc::VTIME] = 0;
        if libc::cfsetispeed(&mut tio, speed) != 0 || libc::cfsetospeed(&mut tio, speed) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::tcsetattr(fd, libc::TCSANOW, &tio) != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(file)
}

#[cfg(unix)]
fn baud_constant(baudrate: u32) -> Option<libc::speed_t> {
    let speed = match baudrate {
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        _ => return None,
    };
    Some(speed)
}

/// Fora de unix o dispositivo é aberto como está; o baud rate vem do driver.
#[cfg(not(unix))]
pub fn open(device: &str, _baudrate: u32) -> io::Result<File> {
    tracing::warn!("Baud rate não configurado nesta plataforma, usando o padrão do driver");
    std::fs::OpenOptions::new().read(true).open(device)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn maps_common_baud_rates() {
        assert_eq!(baud_constant(115200), Some(libc::B115200));
        assert_eq!(baud_constant(9600), Some(libc::B9600));
        assert_eq!(baud_constant(12345), None);
    }

    #[test]
    fn unsupported_baud_rate_is_rejected_before_open() {
        let err = open("/nonexistent/tty", 12345).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn missing_device_is_not_found() {
        let err = open("/nonexistent/tty", 115200).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
