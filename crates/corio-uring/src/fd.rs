//! Owned file descriptors and listener-socket setup.

use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;

/// Owned fd, closed on drop. Move-only.
pub struct Fd {
    raw: RawFd,
}

impl Fd {
    pub fn new(raw: RawFd) -> Self {
        Self { raw }
    }

    pub fn get(&self) -> RawFd {
        self.raw
    }

    pub fn is_valid(&self) -> bool {
        self.raw >= 0
    }

    /// Give up ownership without closing.
    pub fn release(mut self) -> RawFd {
        std::mem::replace(&mut self.raw, -1)
    }

    /// Open, bind and listen a TCP socket; `setup` runs between `socket`
    /// and `bind` (socket options). Returns an invalid fd on failure.
    pub fn open_socket(addr: SocketAddrV4, backlog: usize, setup: fn(RawFd)) -> Self {
        unsafe {
            let fd = libc::socket(libc::PF_INET, libc::SOCK_STREAM, 0);
            if fd < 0 {
                return Self::new(-1);
            }
            setup(fd);
            let sockaddr = sockaddr_in_from(addr);
            if libc::bind(
                fd,
                (&sockaddr as *const libc::sockaddr_in).cast(),
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ) < 0
            {
                libc::close(fd);
                return Self::new(-1);
            }
            if libc::listen(fd, backlog as libc::c_int) < 0 {
                libc::close(fd);
                return Self::new(-1);
            }
            Self::new(fd)
        }
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        if self.is_valid() {
            unsafe { libc::close(self.raw) };
        }
    }
}

pub fn sockaddr_in_from(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut out: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    out.sin_family = libc::AF_INET as libc::sa_family_t;
    out.sin_port = addr.port().to_be();
    out.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());
    out
}

pub fn sockaddr_in_to(addr: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        std::net::Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes()),
        u16::from_be(addr.sin_port),
    )
}
