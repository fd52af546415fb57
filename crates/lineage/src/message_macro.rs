//! Macros for reducing message boilerplate.

/// Implement [`Message`](crate::Message) and [`Command`](crate::Command) for a type.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug)]
/// struct RegisterUser { email: String }
///
/// lineage::impl_command!(RegisterUser);
/// ```
#[macro_export]
macro_rules! impl_command {
    ($ty:ty) => {
        impl $crate::Message for $ty {
            fn message_type(&self) -> $crate::MessageType {
                $crate::MessageType::Command
            }
        }

        impl $crate::Command for $ty {}
    };
}

/// Implement [`Message`](crate::Message) and [`Query`](crate::Query) for a
/// type, naming the type its handler returns.
///
/// ```ignore
/// #[derive(Debug)]
/// struct FindUser { id: Uuid }
///
/// lineage::impl_query!(FindUser => Option<User>);
/// ```
#[macro_export]
macro_rules! impl_query {
    ($ty:ty => $output:ty) => {
        impl $crate::Message for $ty {
            fn message_type(&self) -> $crate::MessageType {
                $crate::MessageType::Query
            }
        }

        impl $crate::Query for $ty {
            type Output = $output;
        }
    };
}

/// Implement [`Message`](crate::Message) and
/// [`DomainEvent`](crate::DomainEvent) for a type.
#[macro_export]
macro_rules! impl_domain_event {
    ($ty:ty) => {
        impl $crate::Message for $ty {
            fn message_type(&self) -> $crate::MessageType {
                $crate::MessageType::DomainEvent
            }
        }

        impl $crate::DomainEvent for $ty {}
    };
}
