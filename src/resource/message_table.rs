//! Message-table resources (`RT_MESSAGETABLE`).

use scroll::{Pread, Pwrite, SizeWith};

use crate::error_list::{ErrorList, error_codes};
use crate::packed::{PackedByteVector, packed_size_of};

/// `MESSAGE_RESOURCE_ENTRY` flag: the text is UTF-16LE.
pub const MESSAGE_RESOURCE_UNICODE: u16 = 0x0001;
/// `MESSAGE_RESOURCE_ENTRY` flag: the text is UTF-8.
pub const MESSAGE_RESOURCE_UTF8: u16 = 0x0002;

/// `MESSAGE_RESOURCE_BLOCK`
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("MESSAGE_RESOURCE_BLOCK"))]
pub struct MessageResourceBlock {
    pub low_id: u32,
    pub high_id: u32,
    /// Offset of the block's entries, relative to the table start.
    pub offset_to_entries: u32,
}

error_codes! {
    /// Message table diagnostics.
    pub enum MessageTableError("message_table_reader") {
        InvalidBlock => "Message block header cannot be read",
        InvalidMessageEntry => "Message entry is truncated",
        InvalidIdRange => "Message block id range is inverted",
        OverlappingMessageIds => "Message block id ranges overlap",
        TooManyMessages => "Number of messages exceeds the configured limit",
    }
}

/// Options for [`MessageTableDetails::parse`].
#[derive(Debug, Copy, Clone)]
pub struct MessageTableLoadOptions {
    /// Cap on messages decoded across all blocks.
    pub max_message_count: u32,
}

impl Default for MessageTableLoadOptions {
    fn default() -> Self {
        MessageTableLoadOptions {
            max_message_count: 0x1_0000,
        }
    }
}

/// A message's text, per its entry flags.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageText {
    Ansi(String),
    Unicode(String),
    Utf8(String),
}

impl MessageText {
    pub fn as_str(&self) -> &str {
        match self {
            MessageText::Ansi(s) | MessageText::Unicode(s) | MessageText::Utf8(s) => s,
        }
    }
}

/// One decoded message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: u32,
    pub flags: u16,
    pub text: MessageText,
}

/// One block and its messages.
#[derive(Debug, Clone, Default)]
pub struct MessageBlock {
    pub descriptor: MessageResourceBlock,
    pub messages: Vec<Message>,
    pub errors: ErrorList<MessageTableError>,
}

/// A decoded message table.
#[derive(Debug, Clone, Default)]
pub struct MessageTableDetails {
    pub blocks: Vec<MessageBlock>,
    pub errors: ErrorList<MessageTableError>,
}

impl MessageTableDetails {
    /// The message with the given id, wherever its block is.
    pub fn message_by_id(&self, id: u32) -> Option<&Message> {
        self.blocks
            .iter()
            .flat_map(|b| b.messages.iter())
            .find(|m| m.id == id)
    }

    /// Decodes a leaf's bytes.
    pub fn parse(data: &PackedByteVector, options: &MessageTableLoadOptions) -> Self {
        let bytes = data.as_slice();
        let mut details = MessageTableDetails::default();
        let mut offset = 0usize;
        let Ok(number_of_blocks) = bytes.gread_with::<u32>(&mut offset, scroll::LE) else {
            details.errors.add_error(MessageTableError::InvalidBlock);
            return details;
        };

        let mut total_messages = 0u32;
        let mut seen_ranges: Vec<(u32, u32)> = Vec::new();
        for _ in 0..number_of_blocks {
            let Ok(descriptor) = bytes.gread_with::<MessageResourceBlock>(&mut offset, scroll::LE)
            else {
                details.errors.add_error(MessageTableError::InvalidBlock);
                break;
            };
            let mut block = MessageBlock {
                descriptor,
                ..MessageBlock::default()
            };
            if descriptor.low_id > descriptor.high_id {
                block.errors.add_error(MessageTableError::InvalidIdRange);
                details.blocks.push(block);
                continue;
            }
            if seen_ranges
                .iter()
                .any(|&(low, high)| descriptor.low_id <= high && low <= descriptor.high_id)
            {
                details
                    .errors
                    .add_error(MessageTableError::OverlappingMessageIds);
            }
            seen_ranges.push((descriptor.low_id, descriptor.high_id));

            let mut entry_offset = descriptor.offset_to_entries as usize;
            for id in descriptor.low_id..=descriptor.high_id {
                if total_messages >= options.max_message_count {
                    details.errors.add_error(MessageTableError::TooManyMessages);
                    details.blocks.push(block);
                    return details;
                }
                let Ok(length) = bytes.gread_with::<u16>(&mut entry_offset, scroll::LE) else {
                    block
                        .errors
                        .add_error(MessageTableError::InvalidMessageEntry);
                    break;
                };
                let Ok(flags) = bytes.gread_with::<u16>(&mut entry_offset, scroll::LE) else {
                    block
                        .errors
                        .add_error(MessageTableError::InvalidMessageEntry);
                    break;
                };
                if (length as usize) < 4 || entry_offset + length as usize - 4 > bytes.len() {
                    block
                        .errors
                        .add_error(MessageTableError::InvalidMessageEntry);
                    break;
                }
                let text_bytes = &bytes[entry_offset..entry_offset + length as usize - 4];
                entry_offset += length as usize - 4;
                let text = if flags & MESSAGE_RESOURCE_UNICODE != 0 {
                    let units: Vec<u16> = text_bytes
                        .chunks_exact(2)
                        .map(|c| u16::from_le_bytes([c[0], c[1]]))
                        .take_while(|&u| u != 0)
                        .collect();
                    MessageText::Unicode(String::from_utf16_lossy(&units))
                } else {
                    let end = text_bytes
                        .iter()
                        .position(|&b| b == 0)
                        .unwrap_or(text_bytes.len());
                    let text = String::from_utf8_lossy(&text_bytes[..end]).into_owned();
                    if flags & MESSAGE_RESOURCE_UTF8 != 0 {
                        MessageText::Utf8(text)
                    } else {
                        MessageText::Ansi(text)
                    }
                };
                block.messages.push(Message { id, flags, text });
                total_messages += 1;
            }
            details.blocks.push(block);
        }
        details
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scroll::Pwrite;

    fn push_entry(raw: &mut Vec<u8>, flags: u16, text: &[u8]) {
        let length = 4 + text.len() as u16;
        raw.extend_from_slice(&length.to_le_bytes());
        raw.extend_from_slice(&flags.to_le_bytes());
        raw.extend_from_slice(text);
    }

    fn table(overlapping: bool) -> PackedByteVector {
        let mut raw = vec![0u8; 4 + 2 * packed_size_of::<MessageResourceBlock>()];
        raw.pwrite_with(2u32, 0, scroll::LE).unwrap();

        let entries_a = raw.len() as u32;
        push_entry(&mut raw, 0, b"error one\0\0\0");
        let mut wide = Vec::new();
        for unit in "error two".encode_utf16() {
            wide.extend_from_slice(&unit.to_le_bytes());
        }
        wide.extend_from_slice(&[0, 0]);
        push_entry(&mut raw, MESSAGE_RESOURCE_UNICODE, &wide);
        let entries_b = raw.len() as u32;
        push_entry(&mut raw, MESSAGE_RESOURCE_UTF8, b"dritte\0\0");

        raw.pwrite_with(
            MessageResourceBlock {
                low_id: 0x100,
                high_id: 0x101,
                offset_to_entries: entries_a,
            },
            4,
            scroll::LE,
        )
        .unwrap();
        raw.pwrite_with(
            MessageResourceBlock {
                low_id: if overlapping { 0x101 } else { 0x200 },
                high_id: if overlapping { 0x101 } else { 0x200 },
                offset_to_entries: entries_b,
            },
            4 + packed_size_of::<MessageResourceBlock>(),
            scroll::LE,
        )
        .unwrap();
        PackedByteVector::new(raw)
    }

    #[test]
    fn decodes_ansi_unicode_and_utf8_entries() {
        let table = MessageTableDetails::parse(&table(false), &MessageTableLoadOptions::default());
        assert_eq!(table.blocks.len(), 2);
        assert_eq!(table.blocks[0].messages.len(), 2);
        assert_eq!(
            table.message_by_id(0x100).unwrap().text,
            MessageText::Ansi("error one".into())
        );
        assert_eq!(
            table.message_by_id(0x101).unwrap().text,
            MessageText::Unicode("error two".into())
        );
        assert_eq!(
            table.message_by_id(0x200).unwrap().text,
            MessageText::Utf8("dritte".into())
        );
        assert!(!table.errors.has_errors());
    }

    #[test]
    fn overlapping_ranges_are_diagnosed() {
        let table = MessageTableDetails::parse(&table(true), &MessageTableLoadOptions::default());
        assert!(
            table
                .errors
                .has_error(MessageTableError::OverlappingMessageIds)
        );
    }

    #[test]
    fn message_cap_truncates() {
        let options = MessageTableLoadOptions {
            max_message_count: 1,
        };
        let table = MessageTableDetails::parse(&table(false), &options);
        assert!(table.errors.has_error(MessageTableError::TooManyMessages));
        let total: usize = table.blocks.iter().map(|b| b.messages.len()).sum();
        assert_eq!(total, 1);
    }
}
