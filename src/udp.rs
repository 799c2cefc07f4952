//! Socket option helpers tokio does not expose directly.

use socket2::SockRef;
use tokio::net::UdpSocket;

pub(crate) fn set_receive_buffer_size(socket: &UdpSocket, size: usize) -> std::io::Result<()> {
    SockRef::from(socket).set_recv_buffer_size(size)
}

pub(crate) fn set_send_buffer_size(socket: &UdpSocket, size: usize) -> std::io::Result<()> {
    SockRef::from(socket).set_send_buffer_size(size)
}
