//! Request bodies in the provider's REST dialect.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use covenant_core::{
    DeliveryChannel, EmbeddedSigningRequest, EnvelopeDraft, PhoneNumber, RecipientDraft,
    RecipientUpdate, SourceDocument,
};
use serde_json::{json, Map, Value};

pub fn envelope_body(draft: &EnvelopeDraft) -> Value {
    let documents: Vec<Value> = draft
        .documents
        .iter()
        .enumerate()
        .map(|(index, document)| document_entry(index + 1, document))
        .collect();
    let signers: Vec<Value> = draft.recipients.iter().map(signer_entry).collect();

    json!({
        "emailSubject": draft.email_subject,
        "status": "sent",
        "documents": documents,
        "recipients": { "signers": signers },
    })
}

/// Replacement always targets document 1, the contract body.
pub fn replace_document_body(document: &SourceDocument) -> Value {
    json!({ "documents": [document_entry(1, document)] })
}

pub fn recipient_update_body(update: &RecipientUpdate) -> Value {
    let mut signer = Map::new();
    signer.insert("recipientId".into(), json!(update.recipient_id.to_string()));
    signer.insert("name".into(), json!(update.name));
    signer.insert("email".into(), json!(update.email));
    delivery_fields(&mut signer, update.delivery_channel, update.phone.as_ref());
    json!({ "signers": [Value::Object(signer)] })
}

pub fn signing_view_body(request: &EmbeddedSigningRequest) -> Value {
    json!({
        "returnUrl": request.return_url,
        "authenticationMethod": "none",
        "recipientId": request.recipient_id.to_string(),
        "userName": request.name,
        "email": request.email,
        "clientUserId": request.client_user_id,
    })
}

fn document_entry(document_id: usize, document: &SourceDocument) -> Value {
    json!({
        "documentId": document_id.to_string(),
        "name": document.name,
        "fileExtension": extension(&document.name),
        "documentBase64": STANDARD.encode(&document.content),
    })
}

fn signer_entry(recipient: &RecipientDraft) -> Value {
    let mut signer = Map::new();
    signer.insert("recipientId".into(), json!(recipient.recipient_id.to_string()));
    signer.insert("routingOrder".into(), json!(recipient.routing_order.to_string()));
    signer.insert("name".into(), json!(recipient.name));
    signer.insert("email".into(), json!(recipient.email));
    if let Some(client_user_id) = &recipient.client_user_id {
        signer.insert("clientUserId".into(), json!(client_user_id));
    }
    delivery_fields(&mut signer, recipient.delivery_channel, recipient.phone.as_ref());
    Value::Object(signer)
}

fn delivery_fields(signer: &mut Map<String, Value>, channel: DeliveryChannel, phone: Option<&PhoneNumber>) {
    match (channel, phone) {
        (DeliveryChannel::Whatsapp, Some(phone)) => {
            signer.insert("deliveryMethod".into(), json!("WhatsApp"));
            signer.insert(
                "phoneNumber".into(),
                json!({ "countryCode": phone.country_code, "number": phone.number }),
            );
        }
        _ => {
            signer.insert("deliveryMethod".into(), json!("email"));
        }
    }
}

fn extension(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => ext,
        _ => "pdf",
    }
}
