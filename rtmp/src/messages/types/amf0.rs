use bytes::Bytes;
use rml_amf0::{self, Amf0Value};
use std::io::Cursor;

use crate::messages::{MessageDeserializationError, MessageSerializationError, RtmpMessage};

pub fn serialize_command(
    command_name: String,
    transaction_id: f64,
    command_object: Amf0Value,
    mut additional_arguments: Vec<Amf0Value>,
) -> Result<Bytes, MessageSerializationError> {
    let mut values = vec![
        Amf0Value::Utf8String(command_name),
        Amf0Value::Number(transaction_id),
        command_object,
    ];

    values.append(&mut additional_arguments);
    Ok(Bytes::from(rml_amf0::serialize(&values)?))
}

/// Commands from some encoders leave out the transaction id or command object, so only
/// the command name is required.
pub fn deserialize_command(data: &[u8]) -> Result<RtmpMessage, MessageDeserializationError> {
    let mut cursor = Cursor::new(data);
    let mut values = rml_amf0::deserialize(&mut cursor)?.into_iter();

    let command_name = match values.next() {
        Some(Amf0Value::Utf8String(name)) => name,
        _ => return Err(MessageDeserializationError::InvalidMessageFormat),
    };

    let transaction_id = match values.next() {
        Some(Amf0Value::Number(id)) => id,
        None => 0.0,
        Some(_) => return Err(MessageDeserializationError::InvalidMessageFormat),
    };

    let command_object = values.next().unwrap_or(Amf0Value::Null);

    Ok(RtmpMessage::Amf0Command {
        command_name,
        transaction_id,
        command_object,
        additional_arguments: values.collect(),
    })
}

pub fn serialize_data(values: &Vec<Amf0Value>) -> Result<Bytes, MessageSerializationError> {
    Ok(Bytes::from(rml_amf0::serialize(values)?))
}

pub fn deserialize_data(data: &[u8]) -> Result<RtmpMessage, MessageDeserializationError> {
    let mut cursor = Cursor::new(data);
    let values = rml_amf0::deserialize(&mut cursor)?;
    Ok(RtmpMessage::Amf0Data { values })
}
