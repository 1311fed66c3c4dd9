use futures_util::StreamExt;
use ipnet::IpNet;
use rtnetlink::{
    Handle, new_connection,
    packet_route::link::{LinkAttribute, LinkFlags, LinkHeader, LinkMessage},
};

use crate::backend::BackendError;

fn netlink_error(e: impl std::fmt::Display) -> BackendError {
    BackendError::Interface(e.to_string())
}

async fn link_index(handle: &Handle, interface: &str) -> Result<u32, BackendError> {
    let mut link_list_stream = handle
        .link()
        .get()
        .match_name(interface.to_string())
        .execute();

    match link_list_stream.next().await {
        Some(Ok(link_msg)) => Ok(link_msg.header.index),
        _ => Err(BackendError::Interface(format!(
            "failed to find interface {}",
            interface
        ))),
    }
}

/// Assign every address in `addrs` to `interface`
pub async fn add_addrs(interface: &str, addrs: &[IpNet]) -> Result<(), BackendError> {
    let (connection, handle, _) = new_connection().map_err(netlink_error)?;
    let conn_poll = tokio::spawn(connection);

    let result = async {
        let index = link_index(&handle, interface).await?;
        for addr in addrs {
            handle
                .address()
                .add(index, addr.addr(), addr.prefix_len())
                .execute()
                .await
                .map_err(netlink_error)?;
        }
        Ok::<(), BackendError>(())
    }
    .await;

    conn_poll.abort();
    result
}

pub async fn link_up_with_mtu(interface: &str, mtu: u32) -> Result<(), BackendError> {
    let (connection, handle, _) = new_connection().map_err(netlink_error)?;
    let conn_poll = tokio::spawn(connection);

    let result = async {
        let index = link_index(&handle, interface).await?;

        let mut message = LinkMessage::default();
        message.header = LinkHeader {
            index,
            flags: LinkFlags::Up,
            ..Default::default()
        };
        message.attributes = vec![LinkAttribute::Mtu(mtu)];

        handle
            .link()
            .set(message)
            .execute()
            .await
            .map_err(netlink_error)
    }
    .await;

    conn_poll.abort();
    result
}
