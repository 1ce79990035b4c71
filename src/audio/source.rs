//! 输入流
//!
//! 原始交织 PCM 字节流，来源可以是 stdin、命名管道或 TCP 连接。
//! 管道和 socket 的一次 read 可能远小于请求的块大小，
//! 因此短读必须继续读到块满，只有 read 返回 0 才算流结束。

use std::fs::File;
use std::io::{self, Read};
use std::net::TcpStream;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::Path;

/// 一次块读取的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// 实际读到的字节数；小于请求值只发生在流结束时
    pub bytes: usize,
    /// 底层 read 调用次数（包括返回 0 的那一次）
    pub attempts: u32,
}

impl ReadOutcome {
    #[inline]
    pub fn is_eof(&self, requested: usize) -> bool {
        self.bytes < requested
    }
}

/// 阻塞读满 `buf`，直到读够或遇到流结束
///
/// `Interrupted` 不算短读，透明重试；其它错误直接返回。
///
/// 注意：没有尝试次数或时间上限。一个永远不给满块也不结束的上游
/// 会让调用方无限阻塞在这里。
pub fn read_exact_or_eof<R: Read + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
) -> io::Result<ReadOutcome> {
    let mut filled = 0;
    let mut attempts = 0;

    while filled < buf.len() {
        attempts += 1;
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(ReadOutcome {
        bytes: filled,
        attempts,
    })
}

/// 调度器需要的输入流能力
///
/// 除了读之外，启动前的动态等待需要知道上游何时可读、
/// 上游缓冲有多大、已经缓冲了多少。默认实现表示"不知道"。
pub trait PcmSource: Read {
    /// 阻塞直到有数据可读（或对端关闭）
    fn wait_readable(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// 上游缓冲容量（字节）
    fn pipeline_capacity(&self) -> Option<usize> {
        None
    }

    /// 当前已缓冲、可立即读取的字节数
    fn buffered_bytes(&self) -> Option<usize> {
        None
    }
}

impl<T: PcmSource + ?Sized> PcmSource for Box<T> {
    fn wait_readable(&mut self) -> io::Result<()> {
        (**self).wait_readable()
    }

    fn pipeline_capacity(&self) -> Option<usize> {
        (**self).pipeline_capacity()
    }

    fn buffered_bytes(&self) -> Option<usize> {
        (**self).buffered_bytes()
    }
}

/// 具体的输入来源
#[derive(Debug)]
pub enum InputStream {
    /// 标准输入（不经过 std 的行缓冲）
    Stdin(File),
    /// 命名管道或普通文件
    Pipe(File),
    /// TCP 连接
    Tcp(TcpStream),
}

impl InputStream {
    /// 打开标准输入
    pub fn stdin() -> io::Result<Self> {
        let fd = io::stdin().as_fd().try_clone_to_owned()?;
        Ok(Self::Stdin(File::from(fd)))
    }

    /// 打开命名管道或文件
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self::Pipe(File::open(path)?))
    }

    /// 连接 `host:port`
    pub fn connect(host: &str, port: u16) -> io::Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        Ok(Self::Tcp(stream))
    }

    /// 设置 socket 接收缓冲区大小（SO_RCVBUF）
    ///
    /// 小于 128 的值提升到 128；非 socket 来源直接忽略。
    pub fn set_receive_buffer(&self, bytes: usize) -> io::Result<()> {
        let Self::Tcp(stream) = self else {
            return Ok(());
        };
        let size: libc::c_int = bytes.max(128).min(libc::c_int::MAX as usize) as libc::c_int;
        let rc = unsafe {
            libc::setsockopt(
                stream.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &size as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        log::info!("Network receive buffer set to {} bytes", size);
        Ok(())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stdin(_) => "stdin",
            Self::Pipe(_) => "pipe",
            Self::Tcp(_) => "tcp",
        }
    }

    fn raw_fd(&self) -> RawFd {
        match self {
            Self::Stdin(f) | Self::Pipe(f) => f.as_raw_fd(),
            Self::Tcp(s) => s.as_raw_fd(),
        }
    }
}

impl Read for InputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Stdin(f) | Self::Pipe(f) => f.read(buf),
            Self::Tcp(s) => s.read(buf),
        }
    }
}

impl PcmSource for InputStream {
    fn wait_readable(&mut self) -> io::Result<()> {
        let mut pfd = libc::pollfd {
            fd: self.raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
            if rc > 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn pipeline_capacity(&self) -> Option<usize> {
        let fd = self.raw_fd();
        match self {
            Self::Tcp(_) => socket_receive_buffer(fd),
            Self::Stdin(_) | Self::Pipe(_) => pipe_size(fd).or_else(|| socket_receive_buffer(fd)),
        }
    }

    fn buffered_bytes(&self) -> Option<usize> {
        let mut n: libc::c_int = 0;
        let rc = unsafe { libc::ioctl(self.raw_fd(), libc::FIONREAD as _, &mut n) };
        if rc < 0 || n < 0 {
            return None;
        }
        Some(n as usize)
    }
}

#[cfg(target_os = "linux")]
fn pipe_size(fd: RawFd) -> Option<usize> {
    let rc = unsafe { libc::fcntl(fd, libc::F_GETPIPE_SZ) };
    (rc > 0).then_some(rc as usize)
}

#[cfg(not(target_os = "linux"))]
fn pipe_size(_fd: RawFd) -> Option<usize> {
    None
}

fn socket_receive_buffer(fd: RawFd) -> Option<usize> {
    let mut size: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &mut size as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    (rc == 0 && size > 0).then_some(size as usize)
}
