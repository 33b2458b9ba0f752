// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Firmware bootloader protocol driver.
//!
//! Runs inside the per-node task of the target node, which gives it
//! exclusive use of the node's mailbox: every request is followed by
//! exactly one expected ack, consumed straight off the queue. Any other
//! message during the exchange is a protocol error and aborts the
//! operation, leaving the node in its bootloader for a retry.

use super::{ControllerError, FirmwareOperation, NetworkController};
use nocan::can::{Message, NodeId};
use nocan::crc::crc32;
use nocan::event::{Event, FirmwareProgress, ProgressReport};
use nocan::sys::{
    SysFunction, BOOTLOADER_MEMORY_FLASH, FLASH_APP_LENGTH, FLASH_APP_ORIGIN, FLASH_PAGE_SIZE,
};
use tokio::sync::mpsc;
use tracing::debug;

/// Write one firmware image into the node's application flash.
pub(crate) async fn upload(
    ctrl: &NetworkController,
    node: NodeId,
    rx: &mut mpsc::Receiver<Message>,
    op: &FirmwareOperation,
) -> Result<(), ControllerError> {
    #[cfg(feature = "strict-signature")]
    check_signature(ctrl, node, rx, op).await?;

    set_address(ctrl, node, rx, FLASH_APP_ORIGIN)
        .await
        .map_err(|e| fail(op, node, e))?;

    ctrl.send_system_message(node, SysFunction::BootloaderErase, 0, &[])
        .await
        .map_err(|e| fail(op, node, e))?;
    NetworkController::expect_system_message(rx, SysFunction::BootloaderEraseAck)
        .await
        .map_err(|e| fail(op, node, e))?;

    let mut total_uploaded: u32 = 0;
    for block in &op.firmware.blocks {
        let block_size = block.data.len() as u32;
        let mut page_offset: u32 = 0;
        while page_offset < block_size {
            set_address(ctrl, node, rx, block.offset + page_offset)
                .await
                .map_err(|e| fail(op, node, e))?;

            progress(op, node, (page_offset * 100 / block_size) as u8, total_uploaded);

            let page_end = (page_offset + FLASH_PAGE_SIZE).min(block_size);
            let page = &block.data[page_offset as usize..page_end as usize];

            ctrl.send_system_message(node, SysFunction::BootloaderWrite, 0, page)
                .await
                .map_err(|e| fail(op, node, e))?;
            NetworkController::expect_system_message(rx, SysFunction::BootloaderWriteAck)
                .await
                .map_err(|e| fail(op, node, e))?;

            // CRC trailer closes the page; a 0xFF ack means the node's
            // flash controller saw different bytes.
            let crc = crc32(page);
            ctrl.send_system_message(node, SysFunction::BootloaderWrite, 1, &crc.to_be_bytes())
                .await
                .map_err(|e| fail(op, node, e))?;
            let ack =
                NetworkController::expect_system_message(rx, SysFunction::BootloaderWriteAck)
                    .await
                    .map_err(|e| fail(op, node, e))?;
            let (_, ack_param) = ack.sys_function_param();
            if ack_param == 0xFF {
                let returned = ack.bytes();
                return Err(fail(
                    op,
                    node,
                    ControllerError::AckFailure(format!(
                        "CRC32 mismatch on page at 0x{:x} (node reported {:02x?})",
                        block.offset + page_offset,
                        returned
                    )),
                ));
            }

            total_uploaded += page.len() as u32;
            page_offset += FLASH_PAGE_SIZE;
        }
    }

    ctrl.send_system_message(node, SysFunction::BootloaderLeave, 0, &[])
        .await
        .map_err(|e| fail(op, node, e))?;

    progress(op, node, 100, total_uploaded);
    send_progress(op, node, ProgressReport::Success, 0);
    Ok(())
}

/// Read the node's application flash back into a firmware image.
pub(crate) async fn download(
    ctrl: &NetworkController,
    node: NodeId,
    rx: &mut mpsc::Receiver<Message>,
    op: &FirmwareOperation,
) -> Result<(), ControllerError> {
    #[cfg(feature = "strict-signature")]
    check_signature(ctrl, node, rx, op).await?;

    let limit = op.firmware.limit;
    let mem_length = if limit == 0 || limit > FLASH_APP_LENGTH {
        FLASH_APP_LENGTH
    } else {
        limit
    };
    let pages = mem_length.div_ceil(FLASH_PAGE_SIZE);

    let mut image: Vec<u8> = Vec::with_capacity((pages * FLASH_PAGE_SIZE) as usize);
    for page in 0..pages {
        let address = FLASH_APP_ORIGIN + page * FLASH_PAGE_SIZE;
        set_address(ctrl, node, rx, address)
            .await
            .map_err(|e| fail(op, node, e))?;

        ctrl.send_system_message(
            node,
            SysFunction::BootloaderRead,
            FLASH_PAGE_SIZE as u8,
            &[],
        )
        .await
        .map_err(|e| fail(op, node, e))?;
        let response = NetworkController::expect_system_message(rx, SysFunction::BootloaderReadAck)
            .await
            .map_err(|e| fail(op, node, e))?;
        image.extend_from_slice(response.bytes());

        let transferred = image.len() as u32;
        progress(
            op,
            node,
            ((u64::from(transferred) * 100 / u64::from(mem_length)).min(100)) as u8,
            transferred,
        );
    }

    ctrl.send_system_message(node, SysFunction::BootloaderLeave, 0, &[])
        .await
        .map_err(|e| fail(op, node, e))?;

    progress(op, node, 100, mem_length);
    send_progress(op, node, ProgressReport::Success, 0);

    let mut firmware = op.firmware.clone();
    firmware.append_block(FLASH_APP_ORIGIN, &image);
    op.client.send(0, Event::NodeFirmware(firmware));
    Ok(())
}

/// Verify the bootloader's device signature before touching flash.
#[cfg(feature = "strict-signature")]
async fn check_signature(
    ctrl: &NetworkController,
    node: NodeId,
    rx: &mut mpsc::Receiver<Message>,
    op: &FirmwareOperation,
) -> Result<(), ControllerError> {
    use nocan::sys::FLASH_DEVICE_SIGNATURE;

    ctrl.send_system_message(node, SysFunction::BootloaderGetSignature, 0, &[])
        .await
        .map_err(|e| fail(op, node, e))?;
    let response =
        NetworkController::expect_system_message(rx, SysFunction::BootloaderGetSignatureAck)
            .await
            .map_err(|e| fail(op, node, e))?;

    let sig = response.bytes();
    if sig.len() != 4 {
        return Err(fail(
            op,
            node,
            ControllerError::AckFailure(format!(
                "unexpected signature length ({} bytes)",
                sig.len()
            )),
        ));
    }
    // Byte 2 varies across silicon revisions and is not checked.
    if sig[0] != FLASH_DEVICE_SIGNATURE[0]
        || sig[1] != FLASH_DEVICE_SIGNATURE[1]
        || sig[3] != FLASH_DEVICE_SIGNATURE[3]
    {
        return Err(fail(
            op,
            node,
            ControllerError::AckFailure(format!("unexpected device signature: {:02x?}", sig)),
        ));
    }
    Ok(())
}

async fn set_address(
    ctrl: &NetworkController,
    node: NodeId,
    rx: &mut mpsc::Receiver<Message>,
    address: u32,
) -> Result<(), ControllerError> {
    debug!("Bootloader set address 0x{:08x} on node {}", address, node);
    ctrl.send_system_message(
        node,
        SysFunction::BootloaderSetAddress,
        BOOTLOADER_MEMORY_FLASH,
        &address.to_be_bytes(),
    )
    .await?;
    NetworkController::expect_system_message(rx, SysFunction::BootloaderSetAddressAck).await?;
    Ok(())
}

fn progress(op: &FirmwareOperation, node: NodeId, percent: u8, transferred: u32) {
    send_progress(op, node, ProgressReport::Percent(percent), transferred);
}

fn send_progress(op: &FirmwareOperation, node: NodeId, report: ProgressReport, transferred: u32) {
    op.client.send(
        0,
        Event::NodeFirmwareProgress(FirmwareProgress::new(node, report, transferred)),
    );
}

/// Report the failure to the owning client and pass the error through.
fn fail(op: &FirmwareOperation, node: NodeId, e: ControllerError) -> ControllerError {
    send_progress(op, node, ProgressReport::Failed, 0);
    e
}
