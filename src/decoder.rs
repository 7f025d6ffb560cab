//! MIME message decoding
//!
//! Pure transformation of one [`RawMessage`] into one [`EmailRecord`].
//! No network I/O; the coordinator schedules calls on blocking worker
//! threads since parsing is CPU-bound.
//!
//! Decoding is lenient where the message is merely incomplete: a
//! missing Subject header or an absent text body yields `None`, and a
//! message with zero attachments is valid. Only a structurally
//! unusable envelope (unparsable headers, missing From) is an error.

use crate::error::DecodeError;
use crate::message::{Attachment, EmailRecord, RawMessage};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail, parse_mail};

/// Decode a raw RFC 2822/MIME message into a structured record.
///
/// Multipart payloads are walked recursively; inline text parts are
/// joined into `text` and attachment parts are extracted in their
/// order of appearance. Idempotent: decoding the same bytes twice
/// yields structurally equal records.
///
/// # Errors
///
/// Returns `DecodeError::MalformedMessage` when the envelope cannot
/// be parsed or the From header is missing.
pub fn decode(raw: RawMessage) -> Result<EmailRecord, DecodeError> {
    let parsed =
        parse_mail(&raw.bytes).map_err(|e| DecodeError::MalformedMessage(e.to_string()))?;

    let from = parsed
        .headers
        .get_first_value("From")
        .ok_or_else(|| DecodeError::MalformedMessage("missing From header".to_string()))?;
    let subject = parsed.headers.get_first_value("Subject");

    let mut texts = Vec::new();
    let mut attachments = Vec::new();
    collect_parts(&parsed, &mut texts, &mut attachments)?;

    let text = if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    };

    Ok(EmailRecord {
        id: raw.id,
        from,
        subject,
        text,
        attachments,
    })
}

/// Walk one MIME part, recursing into multipart containers and
/// classifying each leaf as inline text or attachment.
fn collect_parts(
    part: &ParsedMail<'_>,
    texts: &mut Vec<String>,
    attachments: &mut Vec<Attachment>,
) -> Result<(), DecodeError> {
    if part.ctype.mimetype.starts_with("multipart/") {
        for sub in &part.subparts {
            collect_parts(sub, texts, attachments)?;
        }
        return Ok(());
    }

    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned());

    // An explicit attachment disposition, or an inline part that
    // declares a filename, is an attachment; everything else with a
    // text/plain content type contributes to the inline body.
    let is_attachment = disposition.disposition == DispositionType::Attachment
        || (disposition.disposition == DispositionType::Inline && filename.is_some());

    if is_attachment {
        let content = part
            .get_body_raw()
            .map_err(|e| DecodeError::MalformedMessage(e.to_string()))?;
        attachments.push(Attachment {
            filename,
            size: content.len(),
            content,
        });
    } else if part.ctype.mimetype == "text/plain" {
        let body = part
            .get_body()
            .map_err(|e| DecodeError::MalformedMessage(e.to_string()))?;
        texts.push(body);
    }

    Ok(())
}
