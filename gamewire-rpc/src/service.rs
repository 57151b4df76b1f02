//! Service declarations, implementations and the service table.
//!
//! Services are registered explicitly: a [`ServiceDescriptor`] declares the
//! contract, an [`RpcService`] implements one or more contracts, and
//! [`ServiceCatalog::build`] checks everything up front:
//!
//! - every parameter and return type is in the [`RpcType`] set
//! - every method is declared fallible
//! - signatures are unique within a service
//! - a service name has exactly one implementation
//! - an implementation provides every declared method

use crate::error::RpcError;
use crate::messages::{RpcErrorCode, RpcExecute, RpcResult};
use crate::value::{RpcType, RpcValue};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Separator between provider and interface in a service name.
pub const SERVICE_NAME_SEPARATOR: char = '@';

/// Builds the service name for a (provider, interface) pair.
pub fn service_name(provider: &str, interface: &str) -> String {
    format!("{}{}{}", provider, SERVICE_NAME_SEPARATOR, interface)
}

/// Error raised by a service method.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct MethodError(pub String);

impl MethodError {
    pub fn new(message: impl Into<String>) -> Self {
        MethodError(message.into())
    }
}

impl From<&str> for MethodError {
    fn from(message: &str) -> Self {
        MethodError::new(message)
    }
}

impl From<String> for MethodError {
    fn from(message: String) -> Self {
        MethodError(message)
    }
}

/// A method as declared on a service contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    pub params: Vec<String>,
    pub returns: String,
    /// Whether the method declares it can fail. Required.
    pub fallible: bool,
}

impl MethodDescriptor {
    /// A fallible method with no parameters returning `void`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            returns: "void".to_string(),
            fallible: true,
        }
    }

    pub fn param(mut self, ty: impl Into<String>) -> Self {
        self.params.push(ty.into());
        self
    }

    pub fn returns(mut self, ty: impl Into<String>) -> Self {
        self.returns = ty.into();
        self
    }

    pub fn infallible(mut self) -> Self {
        self.fallible = false;
        self
    }

    /// Overload-disambiguating signature, e.g. `enqueue(i64,string)`.
    pub fn signature(&self) -> String {
        let params: Vec<&str> = self.params.iter().map(|p| p.trim()).collect();
        format!("{}({})", self.name, params.join(","))
    }
}

/// A declared service contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub provider: String,
    pub interface: String,
    pub methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(provider: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            interface: interface.into(),
            methods: Vec::new(),
        }
    }

    pub fn method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    pub fn name(&self) -> String {
        service_name(&self.provider, &self.interface)
    }
}

/// A service implementation.
///
/// `invoke` receives the method signature and arguments already checked
/// against the declaration. Return `Ok(None)` from `void` methods.
pub trait RpcService: Send + Sync + 'static {
    fn invoke(&self, signature: &str, args: &[RpcValue]) -> Result<Option<RpcValue>, MethodError>;

    /// Whether this implementation provides `signature`. Checked once when
    /// the table is built.
    fn implements(&self, _signature: &str) -> bool {
        true
    }
}

type MethodFn = Box<dyn Fn(&[RpcValue]) -> Result<Option<RpcValue>, MethodError> + Send + Sync>;

/// An [`RpcService`] made of one closure per signature.
#[derive(Default)]
pub struct MethodTable {
    methods: HashMap<String, MethodFn>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F>(mut self, signature: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[RpcValue]) -> Result<Option<RpcValue>, MethodError> + Send + Sync + 'static,
    {
        self.methods.insert(signature.into(), Box::new(f));
        self
    }
}

impl RpcService for MethodTable {
    fn invoke(&self, signature: &str, args: &[RpcValue]) -> Result<Option<RpcValue>, MethodError> {
        match self.methods.get(signature) {
            Some(f) => f(args),
            None => Err(MethodError(format!("method '{}' not implemented", signature))),
        }
    }

    fn implements(&self, signature: &str) -> bool {
        self.methods.contains_key(signature)
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut signatures: Vec<&String> = self.methods.keys().collect();
        signatures.sort();
        f.debug_struct("MethodTable")
            .field("methods", &signatures)
            .finish()
    }
}

/// A checked method: parsed parameter and return types.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub signature: String,
    pub params: Vec<RpcType>,
    pub returns: RpcType,
}

impl MethodSpec {
    /// Whether `args` match the parameter list.
    pub fn accepts(&self, args: &[RpcValue]) -> bool {
        self.params.len() == args.len()
            && self.params.iter().zip(args).all(|(ty, v)| ty.matches(v))
    }
}

/// A service name bound to its implementation.
#[derive(Clone)]
pub struct ServiceInstance {
    provider: String,
    interface: String,
    methods: HashMap<String, MethodSpec>,
    instance: Arc<dyn RpcService>,
}

impl ServiceInstance {
    pub fn name(&self) -> String {
        service_name(&self.provider, &self.interface)
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn method(&self, signature: &str) -> Option<&MethodSpec> {
        self.methods.get(signature)
    }

    /// Sorted method signatures.
    pub fn signatures(&self) -> Vec<String> {
        let mut sigs: Vec<String> = self.methods.keys().cloned().collect();
        sigs.sort();
        sigs
    }

    pub fn instance(&self) -> &Arc<dyn RpcService> {
        &self.instance
    }
}

impl fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceInstance")
            .field("name", &self.name())
            .field("methods", &self.signatures())
            .finish_non_exhaustive()
    }
}

/// Declarations and implementations to build a [`ServiceTable`] from.
#[derive(Clone, Default)]
pub struct ServiceCatalog {
    declarations: Vec<ServiceDescriptor>,
    implementations: Vec<(Arc<dyn RpcService>, Vec<String>)>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a service contract.
    pub fn declare(mut self, descriptor: ServiceDescriptor) -> Self {
        self.declarations.push(descriptor);
        self
    }

    /// Binds one implementation instance under each listed service name.
    pub fn implement<S, I, N>(mut self, instance: S, services: I) -> Self
    where
        S: RpcService,
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let names = services.into_iter().map(Into::into).collect();
        self.implementations.push((Arc::new(instance), names));
        self
    }

    /// Checks every declaration and binding and builds the table.
    pub fn build(&self) -> Result<ServiceTable, RpcError> {
        let mut declared: HashMap<String, (&ServiceDescriptor, HashMap<String, MethodSpec>)> =
            HashMap::new();

        for desc in &self.declarations {
            let name = desc.name();
            check_name_part(&name, "provider", &desc.provider)?;
            check_name_part(&name, "interface", &desc.interface)?;
            if declared.contains_key(&name) {
                return Err(RpcError::InvalidService {
                    service: name,
                    reason: "declared more than once".to_string(),
                });
            }
            let methods = check_methods(&name, &desc.methods)?;
            declared.insert(name, (desc, methods));
        }

        let mut services = HashMap::new();
        for (instance, names) in &self.implementations {
            for name in names {
                let (desc, methods) = declared.get(name).ok_or_else(|| RpcError::InvalidService {
                    service: name.clone(),
                    reason: "implemented but never declared".to_string(),
                })?;

                if services.contains_key(name) {
                    return Err(RpcError::DuplicateService(name.clone()));
                }

                for signature in methods.keys() {
                    if !instance.implements(signature) {
                        return Err(RpcError::InvalidMethod {
                            service: name.clone(),
                            method: signature.clone(),
                            reason: "declared but not implemented".to_string(),
                        });
                    }
                }

                services.insert(
                    name.clone(),
                    ServiceInstance {
                        provider: desc.provider.clone(),
                        interface: desc.interface.clone(),
                        methods: methods.clone(),
                        instance: instance.clone(),
                    },
                );
            }
        }

        for name in declared.keys().filter(|n| !services.contains_key(*n)) {
            tracing::debug!("Service '{}' declared without implementation", name);
        }

        Ok(ServiceTable { services })
    }
}

impl fmt::Debug for ServiceCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCatalog")
            .field("declarations", &self.declarations.len())
            .field("implementations", &self.implementations.len())
            .finish()
    }
}

fn check_name_part(service: &str, what: &str, part: &str) -> Result<(), RpcError> {
    if part.trim().is_empty() {
        return Err(RpcError::InvalidService {
            service: service.to_string(),
            reason: format!("{} name is empty", what),
        });
    }
    if part.contains(SERVICE_NAME_SEPARATOR) {
        return Err(RpcError::InvalidService {
            service: service.to_string(),
            reason: format!("{} name contains '{}'", what, SERVICE_NAME_SEPARATOR),
        });
    }
    Ok(())
}

fn check_methods(
    service: &str,
    methods: &[MethodDescriptor],
) -> Result<HashMap<String, MethodSpec>, RpcError> {
    let mut specs = HashMap::new();
    for method in methods {
        let signature = method.signature();
        let invalid = |reason: String| RpcError::InvalidMethod {
            service: service.to_string(),
            method: signature.clone(),
            reason,
        };

        if !method.fallible {
            return Err(invalid("method must be declared fallible".to_string()));
        }

        let params = method
            .params
            .iter()
            .map(|p| RpcType::parse_param(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| invalid(format!("parameter: {}", e)))?;
        let returns =
            RpcType::parse_return(&method.returns).map_err(|e| invalid(format!("return: {}", e)))?;

        if specs.contains_key(&signature) {
            return Err(invalid("duplicate signature".to_string()));
        }
        specs.insert(
            signature.clone(),
            MethodSpec {
                signature,
                params,
                returns,
            },
        );
    }
    Ok(specs)
}

/// Service name to bound instance. Read-only once built.
#[derive(Debug, Clone, Default)]
pub struct ServiceTable {
    services: HashMap<String, ServiceInstance>,
}

impl ServiceTable {
    pub fn get(&self, name: &str) -> Option<&ServiceInstance> {
        self.services.get(name)
    }

    /// Sorted service names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Runs one invocation and packages the outcome.
    ///
    /// Unknown services and methods, mismatched arguments, method errors,
    /// panics and return values that do not match the declaration each map
    /// to their own error code.
    pub fn execute(&self, request: &RpcExecute) -> RpcResult {
        let id = request.request_id;

        let service = match self.get(&request.service_name) {
            Some(service) => service,
            None => {
                tracing::warn!("RPC {}: no such service '{}'", id, request.service_name);
                return RpcResult::error(id, RpcErrorCode::NO_SUCH_MODULE);
            }
        };

        let method = match service.method(&request.method_signature) {
            Some(method) => method,
            None => {
                tracing::warn!(
                    "RPC {}: no method '{}' on '{}'",
                    id,
                    request.method_signature,
                    request.service_name
                );
                return RpcResult::error(id, RpcErrorCode::NO_SUCH_METHOD);
            }
        };

        if !method.accepts(&request.args) {
            tracing::warn!(
                "RPC {}: arguments do not match {}",
                id,
                method.signature
            );
            return RpcResult::error(id, RpcErrorCode::INVALID_ARGUMENTS);
        }

        let instance = service.instance();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            instance.invoke(&method.signature, &request.args)
        }));

        match outcome {
            Ok(Ok(None)) if method.returns.is_void() => RpcResult::void(id),
            Ok(Ok(Some(value))) if !method.returns.is_void() && method.returns.matches(&value) => {
                RpcResult::ok(id, method.returns.to_string(), value)
            }
            Ok(Ok(other)) => {
                tracing::error!(
                    "RPC {}: {} returned {:?}, declared {}",
                    id,
                    method.signature,
                    other,
                    method.returns
                );
                RpcResult::error(id, RpcErrorCode::METHOD_FAILED)
            }
            Ok(Err(e)) => {
                tracing::error!("RPC {}: {} failed: {}", id, method.signature, e);
                RpcResult::error(id, RpcErrorCode::METHOD_FAILED)
            }
            Err(_) => {
                tracing::error!("RPC {}: {} panicked", id, method.signature);
                RpcResult::error(id, RpcErrorCode::METHOD_FAILED)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matchmaker() -> ServiceDescriptor {
        ServiceDescriptor::new("battle", "Matchmaker")
            .method(
                MethodDescriptor::new("enqueue")
                    .param("i64")
                    .param("string")
                    .returns("i32"),
            )
            .method(MethodDescriptor::new("reset"))
            .method(MethodDescriptor::new("crash"))
            .method(MethodDescriptor::new("wrong").returns("string"))
    }

    fn matchmaker_impl() -> MethodTable {
        MethodTable::new()
            .method("enqueue(i64,string)", |args| {
                let player = args[0].as_i64().unwrap_or_default();
                Ok(Some(RpcValue::I32(player as i32 % 4)))
            })
            .method("reset()", |_| Ok(None))
            .method("crash()", |_| panic!("boom"))
            .method("wrong()", |_| Ok(Some(RpcValue::I64(1))))
    }

    fn table() -> ServiceTable {
        ServiceCatalog::new()
            .declare(matchmaker())
            .implement(matchmaker_impl(), ["battle@Matchmaker"])
            .build()
            .unwrap()
    }

    fn exec(sig: &str, args: Vec<RpcValue>) -> RpcExecute {
        RpcExecute {
            request_id: 9,
            service_name: "battle@Matchmaker".to_string(),
            method_signature: sig.to_string(),
            args,
        }
    }

    #[test]
    fn test_signature() {
        let m = MethodDescriptor::new("f").param("i32").param(" list<string> ");
        assert_eq!(m.signature(), "f(i32,list<string>)");
        assert_eq!(MethodDescriptor::new("g").signature(), "g()");
    }

    #[test]
    fn test_build_and_lookup() {
        let table = table();
        assert_eq!(table.names(), vec!["battle@Matchmaker"]);
        let service = table.get("battle@Matchmaker").unwrap();
        assert_eq!(service.provider(), "battle");
        assert_eq!(service.interface(), "Matchmaker");
        assert!(service.method("enqueue(i64,string)").is_some());
        assert!(service.method("enqueue(i32,string)").is_none());
    }

    #[test]
    fn test_execute_success_and_void() {
        let table = table();
        let result = table.execute(&exec("enqueue(i64,string)", vec![RpcValue::I64(6), "eu".into()]));
        assert_eq!(result.request_id, 9);
        assert!(result.error_code.is_ok());
        assert_eq!(result.return_type.as_deref(), Some("i32"));
        assert_eq!(result.value, Some(RpcValue::I32(2)));

        let result = table.execute(&exec("reset()", vec![]));
        assert_eq!(result, RpcResult::void(9));
    }

    #[test]
    fn test_execute_errors() {
        let table = table();

        let mut unknown = exec("reset()", vec![]);
        unknown.service_name = "battle@Nope".to_string();
        let result = table.execute(&unknown);
        assert_eq!(result.error_code, RpcErrorCode::NO_SUCH_MODULE);
        assert!(result.value.is_none() && result.return_type.is_none());

        let result = table.execute(&exec("reset(i32)", vec![]));
        assert_eq!(result.error_code, RpcErrorCode::NO_SUCH_METHOD);

        let result = table.execute(&exec("enqueue(i64,string)", vec![RpcValue::I32(6), "eu".into()]));
        assert_eq!(result.error_code, RpcErrorCode::INVALID_ARGUMENTS);

        let result = table.execute(&exec("enqueue(i64,string)", vec![RpcValue::I64(6)]));
        assert_eq!(result.error_code, RpcErrorCode::INVALID_ARGUMENTS);

        let result = table.execute(&exec("crash()", vec![]));
        assert_eq!(result.error_code, RpcErrorCode::METHOD_FAILED);
        assert!(result.value.is_none());

        let result = table.execute(&exec("wrong()", vec![]));
        assert_eq!(result.error_code, RpcErrorCode::METHOD_FAILED);
    }

    #[test]
    fn test_method_error_maps_to_failed() {
        let table = ServiceCatalog::new()
            .declare(ServiceDescriptor::new("p", "I").method(MethodDescriptor::new("f")))
            .implement(
                MethodTable::new().method("f()", |_| Err("storage offline".into())),
                ["p@I"],
            )
            .build()
            .unwrap();

        let result = table.execute(&RpcExecute {
            request_id: 1,
            service_name: "p@I".to_string(),
            method_signature: "f()".to_string(),
            args: vec![],
        });
        assert_eq!(result.error_code, RpcErrorCode::METHOD_FAILED);
    }

    #[test]
    fn test_rejects_bad_types() {
        let bad_param = ServiceCatalog::new()
            .declare(ServiceDescriptor::new("p", "I").method(MethodDescriptor::new("f").param("Socket")))
            .build();
        assert!(matches!(bad_param, Err(RpcError::InvalidMethod { .. })));

        let void_param = ServiceCatalog::new()
            .declare(ServiceDescriptor::new("p", "I").method(MethodDescriptor::new("f").param("void")))
            .build();
        assert!(matches!(void_param, Err(RpcError::InvalidMethod { .. })));

        let bad_return = ServiceCatalog::new()
            .declare(ServiceDescriptor::new("p", "I").method(MethodDescriptor::new("f").returns("Thread")))
            .build();
        assert!(matches!(bad_return, Err(RpcError::InvalidMethod { .. })));
    }

    #[test]
    fn test_rejects_infallible_and_overload_clash() {
        let infallible = ServiceCatalog::new()
            .declare(ServiceDescriptor::new("p", "I").method(MethodDescriptor::new("f").infallible()))
            .build();
        assert!(matches!(infallible, Err(RpcError::InvalidMethod { .. })));

        let clash = ServiceCatalog::new()
            .declare(
                ServiceDescriptor::new("p", "I")
                    .method(MethodDescriptor::new("f").param("i32"))
                    .method(MethodDescriptor::new("f").param("i32").returns("bool")),
            )
            .build();
        assert!(matches!(clash, Err(RpcError::InvalidMethod { .. })));

        let overload = ServiceCatalog::new()
            .declare(
                ServiceDescriptor::new("p", "I")
                    .method(MethodDescriptor::new("f").param("i32"))
                    .method(MethodDescriptor::new("f").param("i64")),
            )
            .build();
        assert!(overload.is_ok());
    }

    #[test]
    fn test_rejects_bad_names() {
        for (provider, interface) in [("", "I"), ("p", " "), ("a@b", "I")] {
            let result = ServiceCatalog::new()
                .declare(ServiceDescriptor::new(provider, interface))
                .build();
            assert!(matches!(result, Err(RpcError::InvalidService { .. })));
        }

        let twice = ServiceCatalog::new()
            .declare(ServiceDescriptor::new("p", "I"))
            .declare(ServiceDescriptor::new("p", "I"))
            .build();
        assert!(matches!(twice, Err(RpcError::InvalidService { .. })));
    }

    #[test]
    fn test_rejects_duplicate_implementation() {
        let result = ServiceCatalog::new()
            .declare(matchmaker())
            .implement(matchmaker_impl(), ["battle@Matchmaker"])
            .implement(matchmaker_impl(), ["battle@Matchmaker"])
            .build();
        assert!(matches!(result, Err(RpcError::DuplicateService(name)) if name == "battle@Matchmaker"));
    }

    #[test]
    fn test_rejects_undeclared_and_unimplemented() {
        let undeclared = ServiceCatalog::new()
            .implement(MethodTable::new(), ["p@Ghost"])
            .build();
        assert!(matches!(undeclared, Err(RpcError::InvalidService { .. })));

        let missing = ServiceCatalog::new()
            .declare(matchmaker())
            .implement(MethodTable::new().method("reset()", |_| Ok(None)), ["battle@Matchmaker"])
            .build();
        assert!(matches!(missing, Err(RpcError::InvalidMethod { .. })));
    }

    #[test]
    fn test_one_instance_many_services() {
        let shared = MethodTable::new().method("ping()", |_| Ok(Some(RpcValue::Bool(true))));
        let ping = MethodDescriptor::new("ping").returns("bool");
        let table = ServiceCatalog::new()
            .declare(ServiceDescriptor::new("node", "A").method(ping.clone()))
            .declare(ServiceDescriptor::new("node", "B").method(ping))
            .implement(shared, ["node@A", "node@B"])
            .build()
            .unwrap();

        let a = table.get("node@A").unwrap().instance();
        let b = table.get("node@B").unwrap().instance();
        assert!(Arc::ptr_eq(a, b));
        assert_eq!(table.len(), 2);
    }
}
