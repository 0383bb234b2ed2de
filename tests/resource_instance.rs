//! Resource instance rendering, from a client manifest's `use_resources`
//! context to the compiled instance app.

use pretty_assertions::assert_eq;
use std::collections::BTreeMap;

use lainbuild_core::manifest::resource::{compile_resource_instance, render_resource_instance};
use lainbuild_core::{ClusterConfig, ManifestCompiler};

const REGISTRY: &str = "registry.lain.local";

const REDIS_CLIENT: &str = "
appname: hello
build:
  base: golang
  script:
    - go build -o hello
release:
  dest_base: ubuntu
  copy:
    - src: hello
      dest: /usr/bin/hello
use_resources:
  redis:
    memory: 128M
    services:
      - redis
web:
  cmd: /hello
  env:
    - REDIS_ADDR: redis:3333
";

const REDIS_RESOURCE: &str = "
appname: redis
apptype: resource
build:
  base: golang
  script:
    - go build -o hello
release:
  dest_base: ubuntu
  copy:
    - src: hello
      dest: /usr/bin/hello
service.redis:
  cmd: redis -p 3333
  port: 3333
  memory: \"{{ memory|default('64M') }}\"
  portal:
    image: myregistry.lain.org/proxy:release-1234567-abc
    cmd: ./proxy
";
const REDIS_VERSION: &str = "1439365340-06e92b4456116ad5e6875c8c34797d22156d44a5";

const MYSQL_CLIENT: &str = "
appname: hello
build:
  base: golang
  script:
    - go build -o hello
use_resources:
  mysql:
    memory: 128M
    num_instances: 2
    services:
      - mysqld
web:
  cmd: /hello
  env:
    - MYSQL_ADDR: mysqld:3309
";

const MYSQL_RESOURCE: &str = "
appname: mysql
apptype: resource
build:
  base: golang
  script:
    - go build -o hello
worker.mysqld:
  image: mysql:5.6
  cmd: mysqld {{ memory|default('64M') }}
  port: 3306
  num_instances: \"{{ num_instances|default(1)|int(1) }}\"
  memory: \"{{ memory|default('64M') }}\"
portal.mysqlproxy:
  service_name: mysqld
  image: myregistry.lain.org/proxy:release-1234567-abc
  cmd: mysqlproxy
  port: 3309
";
const MYSQL_VERSION: &str = "1439365343-06e92b4456116ad5e6875c8c34797d22156d44a5";

fn compiler() -> ManifestCompiler {
    ManifestCompiler::new(
        ClusterConfig::default()
            .with_registry(REGISTRY)
            .with_domains(["lain.local"]),
    )
}

fn client_context(compiler: &ManifestCompiler, client: &str, resource: &str) -> BTreeMap<String, serde_yaml::Value> {
    let app = compiler.compile(client, Some("1439365341-06e92b44"), None).unwrap();
    app.use_resources[resource].context.clone()
}

#[test]
fn test_redis_instance() {
    let compiler = compiler();
    let context = client_context(&compiler, REDIS_CLIENT, "redis");

    let yaml = render_resource_instance(&compiler, "redis", REDIS_VERSION, REDIS_RESOURCE, "hello", &context).unwrap();
    let document: serde_yaml::Mapping = serde_yaml::from_str(&yaml).unwrap();
    assert!(!document.contains_key("apptype"));
    assert_eq!(document.get("appname").and_then(|v| v.as_str()), Some("resource.redis.hello"));

    let instance =
        compile_resource_instance(&compiler, "redis", REDIS_VERSION, REDIS_RESOURCE, "hello", &context).unwrap();
    assert_eq!(instance.appname, "resource.redis.hello");

    let redis = &instance.procs["redis"];
    assert_eq!(redis.memory, "128M");
    assert_eq!(redis.image, format!("{}/redis:release-{}", REGISTRY, REDIS_VERSION));

    let portal = &instance.procs["portal-redis"];
    assert_eq!(portal.image, "myregistry.lain.org/proxy:release-1234567-abc");
    assert_eq!(portal.service_name, "redis");
}

#[test]
fn test_mysql_instance() {
    let compiler = compiler();
    let context = client_context(&compiler, MYSQL_CLIENT, "mysql");

    let instance =
        compile_resource_instance(&compiler, "mysql", MYSQL_VERSION, MYSQL_RESOURCE, "hello", &context).unwrap();
    assert_eq!(instance.appname, "resource.mysql.hello");

    let mysqld = &instance.procs["mysqld"];
    assert_eq!(mysqld.memory, "128M");
    assert_eq!(mysqld.num_instances, 2);
    assert_eq!(mysqld.image, "mysql:5.6");
    assert_eq!(mysqld.cmd, vec!["mysqld", "128M"]);

    let proxy = &instance.procs["mysqlproxy"];
    assert_eq!(proxy.image, "myregistry.lain.org/proxy:release-1234567-abc");
}

#[test]
fn test_defaults_without_context() {
    let compiler = compiler();
    let instance = compile_resource_instance(
        &compiler,
        "mysql",
        MYSQL_VERSION,
        MYSQL_RESOURCE,
        "hello",
        &BTreeMap::new(),
    )
    .unwrap();
    let mysqld = &instance.procs["mysqld"];
    assert_eq!(mysqld.memory, "64M");
    assert_eq!(mysqld.num_instances, 1);
    assert_eq!(mysqld.cmd, vec!["mysqld", "64M"]);
}
