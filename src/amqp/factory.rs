use crate::amqp::{adapter::LapinConnection, configuration::RabbitMqSettings};
use crate::transport::{BrokerConnection, Connector};
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
/// All the information required to connect to a RabbitMq broker.
///
/// It is the production [`Connector`]: every call to [`Connector::connect`] performs a single
/// connection attempt.
pub struct ConnectionFactory {
    uri: AMQPUri,
    /// The timeout observed when trying to connect to RabbitMq.
    connection_timeout: Duration,
    /// TLS configuration for the connection to RabbitMq.
    /// If `None`, the connection will not be encrypted.
    tls: Option<Arc<Tls>>,
}

#[derive(Clone)]
struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// If the connection timeout is left unspecified, it will be defaulted to 10 seconds.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let tls = settings
            .tls
            .as_ref()
            .map::<Result<Tls, anyhow::Error>, _>(|tls_settings| {
                let domain_name = tls_settings
                    .domain
                    .clone()
                    .unwrap_or_else(|| settings.uri.clone());

                let mut connector_builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls_settings.ca_certificate_chain()? {
                    connector_builder.add_root_certificate(certificate);
                }
                let connector = connector_builder.build()?;
                Ok(Tls {
                    domain_name,
                    connector,
                })
            })
            .transpose()?;

        let uri = settings.amqp_uri();
        warn_if_heartbeat_missing(&uri);
        Ok(Self {
            uri,
            connection_timeout: settings
                .connection_timeout()
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
            tls: tls.map(Arc::new),
        })
    }

    /// Create a new connection factory from a raw `amqp://` or `amqps://` url.
    ///
    /// `amqps` urls are served by the TLS support built into `lapin`, using the system's trust roots.
    pub fn from_url(url: &str) -> Result<Self, anyhow::Error> {
        let uri = AMQPUri::from_str(url)
            .map_err(|e| anyhow::anyhow!("Invalid AMQP url: {}", e))?;
        warn_if_heartbeat_missing(&uri);
        Ok(Self {
            connection_timeout: uri
                .query
                .connection_timeout
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
            uri,
            tls: None,
        })
    }

    /// Replaces the TLS Connector for the connection factory
    pub fn set_tls_connector(&mut self, connector: NativeTlsConnector) {
        self.set_tls_connector_with_domain(connector, self.uri.authority.host.clone());
    }

    /// Replaces the TLS Connector for the connection factory, along with the expected domain name for the certificate
    pub fn set_tls_connector_with_domain(
        &mut self,
        connector: NativeTlsConnector,
        domain_name: String,
    ) {
        self.tls = Some(Arc::new(Tls {
            connector,
            domain_name,
        }));
    }

    /// The uri connections are opened against.
    pub fn uri(&self) -> &AMQPUri {
        &self.uri
    }

    /// Open a new connection to the broker.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self), fields(host = %self.uri.authority.host))]
    pub async fn new_connection(&self) -> Result<lapin::Connection, anyhow::Error> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let connection = timeout(self.connection_timeout, async {
            match &self.tls {
                None => lapin::Connection::connect_uri(self.uri.clone(), properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        })
        .await??;
        Ok(connection)
    }

    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls_configuration: Arc<Tls>,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // Plain TCP first, then the TLS handshake with our own connector so that the
                // expected certificate domain can differ from the host.
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri.connect().and_then(|tcp| {
                    tcp.into_native_tls(&tls_configuration.connector, &tls_configuration.domain_name)
                })
            }),
            properties,
        )
        .await
    }
}

#[async_trait::async_trait]
impl Connector for ConnectionFactory {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, anyhow::Error> {
        let connection = self.new_connection().await?;
        Ok(Arc::new(LapinConnection::new(connection)))
    }
}

fn warn_if_heartbeat_missing(uri: &AMQPUri) {
    if uri.query.heartbeat.is_none() {
        warn!(
            host = %uri.authority.host,
            "No heartbeat configured for the RabbitMQ connection: a dead connection may go unnoticed"
        );
    }
}
