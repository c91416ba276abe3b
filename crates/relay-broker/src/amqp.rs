//! AMQP 0.9.1 implementation of the broker abstraction on top of `lapin`.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    uri::{AMQPAuthority, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use relay_core::{models::parse_attempt, DeliveryTag, ATTEMPT_HEADER};
use tracing::{debug, info};

use crate::{
    channel::{BrokerChannel, BrokerConnector, DeliveryStream, InboundDelivery},
    error::{BrokerError, Result},
    topology::QueueDeclaration,
};

const JSON_CONTENT_TYPE: &str = "application/json";
const PERSISTENT_DELIVERY_MODE: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Connection parameters for the broker.
#[derive(Debug, Clone)]
pub struct AmqpSettings {
    /// Broker host name.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Login password, already decrypted.
    pub password: String,
    /// Virtual host.
    pub virtual_host: String,
    /// Connection name shown in the management UI.
    pub connection_name: String,
}

impl AmqpSettings {
    fn uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.virtual_host.clone(),
            ..AMQPUri::default()
        }
    }
}

/// Opens `lapin` connections with publisher confirms enabled.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    settings: AmqpSettings,
}

impl AmqpConnector {
    /// Creates a connector for the given settings.
    pub fn new(settings: AmqpSettings) -> Self {
        Self { settings }
    }
}

impl BrokerConnector for AmqpConnector {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<Arc<dyn BrokerChannel>>> + Send + '_>> {
        Box::pin(async move {
            let properties = ConnectionProperties::default()
                .with_connection_name(self.settings.connection_name.clone().into());

            let connection = Connection::connect_uri(self.settings.uri(), properties)
                .await
                .map_err(|e| BrokerError::connection(e.to_string()))?;

            let channel = match open_confirming_channel(&connection).await {
                Ok(channel) => channel,
                Err(error) => {
                    if let Err(close_error) = connection.close(REPLY_SUCCESS, "channel failed").await {
                        debug!(error = %close_error, "failed to close connection");
                    }
                    return Err(error);
                },
            };

            info!(
                host = %self.settings.host,
                port = self.settings.port,
                vhost = %self.settings.virtual_host,
                "connected to broker"
            );

            let channel: Arc<dyn BrokerChannel> = Arc::new(AmqpChannel { connection, channel });
            Ok(channel)
        })
    }
}

async fn open_confirming_channel(connection: &Connection) -> Result<Channel> {
    let channel = connection.create_channel().await?;
    channel.confirm_select(ConfirmSelectOptions::default()).await?;
    Ok(channel)
}

/// Open `lapin` channel together with its connection.
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

impl BrokerChannel for AmqpChannel {
    fn declare_queue(
        &self,
        declaration: &QueueDeclaration,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = declaration.name.clone();
        let arguments = declaration_arguments(declaration);
        Box::pin(async move {
            let options = QueueDeclareOptions { durable: true, ..QueueDeclareOptions::default() };
            self.channel
                .queue_declare(&name, options, arguments)
                .await
                .map_err(|e| BrokerError::declare(name.clone(), e.to_string()))?;
            debug!(queue = %name, "queue declared");
            Ok(())
        })
    }

    fn verify_queue(&self, queue: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let queue = queue.to_string();
        Box::pin(async move {
            let options = QueueDeclareOptions { passive: true, ..QueueDeclareOptions::default() };
            self.channel
                .queue_declare(&queue, options, FieldTable::default())
                .await
                .map_err(|_| BrokerError::QueueMissing { queue: queue.clone() })?;
            Ok(())
        })
    }

    fn consume(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream>> + Send + '_>> {
        let queue = queue.to_string();
        Box::pin(async move {
            let consumer_tag = format!("relay-{}", uuid::Uuid::new_v4());
            let consumer = self
                .channel
                .basic_consume(
                    &queue,
                    &consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Consume { queue: queue.clone(), message: e.to_string() })?;

            info!(queue = %queue, consumer_tag = %consumer_tag, "subscribed");

            let stream = consumer.map(move |item| match item {
                Ok(delivery) => Ok(InboundDelivery {
                    delivery_tag: DeliveryTag(delivery.delivery_tag),
                    attempt: parse_attempt(attempt_header(&delivery.properties).as_deref()),
                    body: Bytes::from(delivery.data),
                }),
                Err(error) => {
                    Err(BrokerError::Consume { queue: queue.clone(), message: error.to_string() })
                },
            });

            let stream: DeliveryStream = Box::pin(stream);
            Ok(stream)
        })
    }

    fn ack(&self, delivery_tag: DeliveryTag) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.channel
                .basic_ack(delivery_tag.0, BasicAckOptions::default())
                .await
                .map_err(|e| BrokerError::acknowledge(delivery_tag.0, e.to_string()))
        })
    }

    fn nack(
        &self,
        delivery_tag: DeliveryTag,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let options = BasicNackOptions { multiple: false, requeue: false };
            self.channel
                .basic_nack(delivery_tag.0, options)
                .await
                .map_err(|e| BrokerError::acknowledge(delivery_tag.0, e.to_string()))
        })
    }

    fn publish(
        &self,
        queue: &str,
        body: Bytes,
        attempt: u32,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let queue = queue.to_string();
        Box::pin(async move {
            let mut headers = FieldTable::default();
            headers.insert(
                ShortString::from(ATTEMPT_HEADER),
                AMQPValue::LongString(LongString::from(attempt.to_string())),
            );
            let properties = BasicProperties::default()
                .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
                .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
                .with_headers(headers);

            let confirmation = self
                .channel
                .basic_publish("", &queue, BasicPublishOptions::default(), &body, properties)
                .await
                .map_err(|e| BrokerError::publish(queue.clone(), e.to_string()))?
                .await
                .map_err(|e| BrokerError::publish(queue.clone(), e.to_string()))?;

            if confirmation.is_nack() {
                return Err(BrokerError::publish(queue, "broker rejected the message"));
            }
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.channel.status().connected() {
                self.channel.close(REPLY_SUCCESS, "shutdown").await?;
            }
            if self.connection.status().connected() {
                self.connection.close(REPLY_SUCCESS, "shutdown").await?;
            }
            Ok(())
        })
    }
}

fn declaration_arguments(declaration: &QueueDeclaration) -> FieldTable {
    let mut arguments = FieldTable::default();

    if let Some(target) = &declaration.dead_letter {
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(target.exchange.clone())),
        );
        arguments.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(target.routing_key.clone())),
        );
    }
    if let Some(ttl) = declaration.message_ttl {
        arguments.insert(ShortString::from("x-message-ttl"), AMQPValue::LongInt(ttl_millis(ttl)));
    }

    arguments
}

fn ttl_millis(ttl: Duration) -> i32 {
    i32::try_from(ttl.as_millis()).unwrap_or(i32::MAX)
}

/// Reads the attempt header as text. Integer-typed values are accepted too.
fn attempt_header(properties: &BasicProperties) -> Option<String> {
    let headers = properties.headers().as_ref()?;
    let (_, value) = headers.inner().iter().find(|(key, _)| key.as_str() == ATTEMPT_HEADER)?;

    match value {
        AMQPValue::LongString(text) => Some(String::from_utf8_lossy(text.as_bytes()).into_owned()),
        AMQPValue::ShortString(text) => Some(text.as_str().to_string()),
        AMQPValue::ShortShortInt(n) => Some(n.to_string()),
        AMQPValue::ShortShortUInt(n) => Some(n.to_string()),
        AMQPValue::ShortInt(n) => Some(n.to_string()),
        AMQPValue::ShortUInt(n) => Some(n.to_string()),
        AMQPValue::LongInt(n) => Some(n.to_string()),
        AMQPValue::LongUInt(n) => Some(n.to_string()),
        AMQPValue::LongLongInt(n) => Some(n.to_string()),
        _ => None,
    }
}
