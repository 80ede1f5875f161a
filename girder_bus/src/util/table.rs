use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};

/// Pushes typed values into a [`FieldTable`] under string keys.
pub trait Push {
    /// Sets a string header under the given key.
    fn push_str(&mut self, key: &str, value: &str);

    /// Sets a boolean header under the given key.
    fn push_bool(&mut self, key: &str, value: bool);

    /// Sets an unsigned integer header under the given key.
    fn push_u32(&mut self, key: &str, value: u32);
}

/// Retrieves typed values from a [`FieldTable`] by string key, coercing the
/// wire representation where AMQP clients disagree on the exact type.
pub trait Retrieve {
    /// Retrieves a string header under the given key, if present.
    fn retrieve_str(&self, key: &str) -> Option<String>;

    /// Retrieves a boolean header under the given key, if present.
    fn retrieve_bool(&self, key: &str) -> Option<bool>;

    /// Retrieves an unsigned integer header under the given key, if present.
    /// Integer headers arrive in whichever width the producing client chose.
    fn retrieve_u32(&self, key: &str) -> Option<u32>;
}

impl Push for FieldTable {
    fn push_str(&mut self, key: &str, value: &str) {
        self.insert(
            ShortString::from(key),
            AMQPValue::LongString(LongString::from(value)),
        );
    }

    fn push_bool(&mut self, key: &str, value: bool) {
        self.insert(ShortString::from(key), AMQPValue::Boolean(value));
    }

    fn push_u32(&mut self, key: &str, value: u32) {
        self.insert(ShortString::from(key), AMQPValue::LongUInt(value));
    }
}

impl Retrieve for FieldTable {
    fn retrieve_str(&self, key: &str) -> Option<String> {
        match self.inner().get(key) {
            Some(AMQPValue::LongString(value)) => Some(value.to_string()),
            Some(AMQPValue::ShortString(value)) => Some(value.to_string()),
            _ => None,
        }
    }

    fn retrieve_bool(&self, key: &str) -> Option<bool> {
        match self.inner().get(key) {
            Some(AMQPValue::Boolean(value)) => Some(*value),
            _ => None,
        }
    }

    fn retrieve_u32(&self, key: &str) -> Option<u32> {
        match self.inner().get(key) {
            Some(AMQPValue::LongUInt(value)) => Some(*value),
            Some(AMQPValue::ShortUInt(value)) => Some(u32::from(*value)),
            Some(AMQPValue::ShortShortUInt(value)) => Some(u32::from(*value)),
            Some(AMQPValue::LongInt(value)) => u32::try_from(*value).ok(),
            Some(AMQPValue::LongLongInt(value)) => u32::try_from(*value).ok(),
            Some(AMQPValue::ShortInt(value)) => u32::try_from(*value).ok(),
            Some(AMQPValue::ShortShortInt(value)) => u32::try_from(*value).ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn push_and_retrieve_round_trip() {
        // Given
        let mut table = FieldTable::default();

        // When
        table.push_str("transactionId", "tx-1");
        table.push_bool("isBuffer", true);
        table.push_u32("retryCount", 4);

        // Then
        assert_eq!(table.retrieve_str("transactionId").as_deref(), Some("tx-1"));
        assert_eq!(table.retrieve_bool("isBuffer"), Some(true));
        assert_eq!(table.retrieve_u32("retryCount"), Some(4));
    }

    #[test]
    fn retrieve_coerces_integer_widths() {
        // Given
        let mut table = FieldTable::default();
        table.insert(ShortString::from("retryCount"), AMQPValue::LongLongInt(7));

        // Then
        assert_eq!(table.retrieve_u32("retryCount"), Some(7));
    }

    #[test]
    fn retrieve_missing_is_none() {
        // Given
        let table = FieldTable::default();

        // Then
        assert_eq!(table.retrieve_str("reason"), None);
        assert_eq!(table.retrieve_bool("isBuffer"), None);
        assert_eq!(table.retrieve_u32("retryCount"), None);
    }
}
