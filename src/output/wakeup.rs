//! 喂数据线程的唤醒机制
//!
//! 两条通道同时触发：
//! - 条件变量：线程在定时等待时使用
//! - 自管道（self-pipe）：线程在 poll 设备描述符时使用
//!
//! 唤醒标志由单独的锁保护，与推模式的状态锁相互独立，
//! 持有状态锁时可以随时调用 `wake()`，反之则不行。

use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// 非阻塞自管道
pub struct WakeupPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakeupPipe {
    pub fn new() -> io::Result<Self> {
        let mut fds: [libc::c_int; 2] = [-1; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let pipe = Self {
            read_fd: fds[0],
            write_fd: fds[1],
        };
        set_nonblock_cloexec(pipe.read_fd)?;
        set_nonblock_cloexec(pipe.write_fd)?;
        Ok(pipe)
    }

    #[inline]
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// 写入一个字节；管道满时忽略（已经有未处理的唤醒）
    pub fn signal(&self) {
        let byte = 0u8;
        unsafe {
            libc::write(self.write_fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }

    /// 读空管道
    pub fn flush(&self) {
        let mut buf = [0u8; 64];
        loop {
            let r = unsafe {
                libc::read(
                    self.read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if r <= 0 {
                break;
            }
        }
    }

    /// 在 `fds` 之外追加管道读端一起 poll（无超时）
    ///
    /// 返回是否被管道唤醒；`EINTR` 视为正常返回
    pub fn poll_with(&self, fds: &mut Vec<libc::pollfd>) -> io::Result<bool> {
        fds.push(libc::pollfd {
            fd: self.read_fd,
            events: libc::POLLIN,
            revents: 0,
        });

        let r = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        let err = io::Error::last_os_error();

        let own = fds.pop();
        let woke = own.map_or(false, |p| p.revents & libc::POLLIN != 0);
        if woke {
            self.flush();
        }

        if r < 0 && err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
        Ok(woke)
    }
}

impl Drop for WakeupPipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

fn set_nonblock_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[derive(Default)]
struct WakeFlags {
    need_wakeup: bool,
    terminate: bool,
}

/// 等待结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// 被 `wake()` 唤醒或超时
    Woken,
    /// 收到退出请求
    Terminate,
    /// poll 失败，调用方应退回定时等待
    PollFailed,
}

/// 喂数据线程唤醒器
pub struct FeederWaker {
    flags: Mutex<WakeFlags>,
    cond: Condvar,
    pipe: Option<WakeupPipe>,
}

impl FeederWaker {
    pub fn new() -> Self {
        let pipe = match WakeupPipe::new() {
            Ok(pipe) => Some(pipe),
            Err(e) => {
                log::warn!("Failed to create wakeup pipe, poll-based waiting disabled: {}", e);
                None
            }
        };

        Self {
            flags: Mutex::new(WakeFlags::default()),
            cond: Condvar::new(),
            pipe,
        }
    }

    fn lock(&self) -> MutexGuard<'_, WakeFlags> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub fn has_pipe(&self) -> bool {
        self.pipe.is_some()
    }

    /// 打断线程当前（或下一次）的等待
    pub fn wake(&self) {
        let mut flags = self.lock();
        flags.need_wakeup = true;
        self.cond.notify_all();
        drop(flags);

        if let Some(ref pipe) = self.pipe {
            pipe.signal();
        }
    }

    /// 请求线程退出
    pub fn terminate(&self) {
        self.lock().terminate = true;
        self.wake();
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().terminate
    }

    /// 定时等待；`None` 表示一直等到被唤醒
    pub fn wait(&self, timeout: Option<Duration>) -> WaitOutcome {
        let mut flags = self.lock();

        if !flags.need_wakeup && !flags.terminate {
            flags = match timeout {
                Some(timeout) => {
                    self.cond
                        .wait_timeout_while(flags, timeout, |f| !f.need_wakeup && !f.terminate)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .cond
                    .wait_while(flags, |f| !f.need_wakeup && !f.terminate)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }

        flags.need_wakeup = false;
        if flags.terminate {
            WaitOutcome::Terminate
        } else {
            WaitOutcome::Woken
        }
    }

    /// 等待设备描述符或唤醒管道
    ///
    /// 调用前必须已经释放推模式状态锁
    pub fn poll(&self, fds: &mut Vec<libc::pollfd>) -> WaitOutcome {
        let Some(ref pipe) = self.pipe else {
            return WaitOutcome::PollFailed;
        };

        {
            let mut flags = self.lock();
            if flags.terminate {
                return WaitOutcome::Terminate;
            }
            if flags.need_wakeup {
                flags.need_wakeup = false;
                return WaitOutcome::Woken;
            }
        }

        // wake() 先置标志再写管道，检查之后的唤醒一定能打断 poll
        let result = pipe.poll_with(fds);

        let mut flags = self.lock();
        flags.need_wakeup = false;
        match result {
            _ if flags.terminate => WaitOutcome::Terminate,
            Ok(_) => WaitOutcome::Woken,
            Err(e) => {
                log::debug!("Audio device poll failed: {}", e);
                WaitOutcome::PollFailed
            }
        }
    }
}

impl Default for FeederWaker {
    fn default() -> Self {
        Self::new()
    }
}
